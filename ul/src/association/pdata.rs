//! Fragmentation of DIMSE messages into P-DATA-TF PDUs.
use dicom_ul::pdu::{write_pdu, PDataValue, PDataValueType, Pdu};
use std::io::Write;

/// Size of the PDV item header
/// (item length, presentation context id and message control header).
const PDV_HEADER_SIZE: u32 = 6;

/// The largest fragment that fits in a single-PDV P-DATA-TF PDU
/// under the given maximum PDU length.
pub(crate) fn max_fragment_len(max_pdu_length: u32) -> u32 {
    max_pdu_length.saturating_sub(PDV_HEADER_SIZE).max(1)
}

/// A writer splitting everything written into it
/// into PDVs of one presentation context,
/// each sent in its own P-DATA-TF PDU.
///
/// The last PDV is only sent on [`finish`](Self::finish),
/// so that it can be flagged as the last fragment.
#[must_use]
pub(crate) struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    presentation_context_id: u8,
    value_type: PDataValueType,
    max_data_len: usize,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    pub(crate) fn new(
        stream: W,
        presentation_context_id: u8,
        value_type: PDataValueType,
        max_pdu_length: u32,
    ) -> Self {
        let max_data_len = max_fragment_len(max_pdu_length) as usize;
        PDataWriter {
            buffer: Vec::with_capacity(max_data_len),
            stream,
            presentation_context_id,
            value_type,
            max_data_len,
        }
    }

    /// Send the remaining data as the last fragment.
    pub(crate) fn finish(mut self) -> std::io::Result<()> {
        self.dispatch_pdu(true)
    }

    fn dispatch_pdu(&mut self, is_last: bool) -> std::io::Result<()> {
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: self.presentation_context_id,
                value_type: self.value_type.clone(),
                is_last,
                data: std::mem::take(&mut self.buffer),
            }],
        };
        let mut encoded = Vec::with_capacity(self.max_data_len + 12);
        write_pdu(&mut encoded, &pdu)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.stream.write_all(&encoded)?;
        self.buffer.reserve(self.max_data_len);
        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.buffer.len() == self.max_data_len {
            // more data follows, so this one is not the last
            self.dispatch_pdu(false)?;
        }
        let room = self.max_data_len - self.buffer.len();
        let buf = &buf[..buf.len().min(room)];
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
