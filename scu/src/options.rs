//! Configuration of the service class user.
use dicom_dictionary_std::uids;
use dimse_ul::ReleaseMode;
use std::time::Duration;

/// Options for the service class user,
/// built in the style of a builder.
///
/// # Example
///
/// ```
/// # use dimse_scu::ScuOptions;
/// # use std::time::Duration;
/// let options = ScuOptions::new()
///     .calling_ae_title("VIEWER")
///     .called_ae_title("PACS")
///     .host("pacs.example.org")
///     .port(11112)
///     .response_timeout(Duration::from_secs(30));
/// assert_eq!(options.address(), "pacs.example.org:11112");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScuOptions {
    /// the calling AE title
    calling_ae_title: String,
    /// the called AE title
    called_ae_title: String,
    host: String,
    port: u16,
    /// the transfer syntaxes proposed for query and retrieve contexts
    transfer_syntaxes: Vec<String>,
    /// the storage SOP classes accepted in the SCP role during C-GET
    retrieve_storage_classes: Vec<String>,
    connect_timeout: Duration,
    /// how long to wait for each response
    response_timeout: Duration,
    /// how long the reader waits for the peer before checking for requests
    poll_interval: Duration,
    cache_interval: Duration,
    move_release_mode: ReleaseMode,
    max_pdu_length: u32,
}

impl Default for ScuOptions {
    fn default() -> Self {
        ScuOptions {
            calling_ae_title: "THIS-SCU".to_string(),
            called_ae_title: "ANY-SCP".to_string(),
            host: "localhost".to_string(),
            port: 104,
            transfer_syntaxes: vec![uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
            retrieve_storage_classes: Vec::new(),
            connect_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(100),
            cache_interval: Duration::from_secs(600),
            move_release_mode: ReleaseMode::Abort,
            max_pdu_length: dicom_ul::pdu::reader::DEFAULT_MAX_PDU,
        }
    }
}

impl ScuOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title.
    pub fn calling_ae_title(mut self, calling_ae_title: impl Into<String>) -> Self {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title.
    pub fn called_ae_title(mut self, called_ae_title: impl Into<String>) -> Self {
        self.called_ae_title = called_ae_title.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Replace the transfer syntaxes proposed for query and retrieve.
    ///
    /// An empty list is ignored.
    pub fn transfer_syntaxes<I, T>(mut self, transfer_syntaxes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let transfer_syntaxes: Vec<String> =
            transfer_syntaxes.into_iter().map(Into::into).collect();
        if !transfer_syntaxes.is_empty() {
            self.transfer_syntaxes = transfer_syntaxes;
        }
        self
    }

    /// Accept instances of the given storage SOP class
    /// sent back by the peer during C-GET.
    pub fn with_retrieve_storage_class(mut self, sop_class_uid: impl Into<String>) -> Self {
        self.retrieve_storage_classes.push(sop_class_uid.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the interval at which the result cache is cleared.
    pub fn cache_interval(mut self, interval: Duration) -> Self {
        self.cache_interval = interval;
        self
    }

    /// Override how associations are ended after a C-MOVE.
    pub fn move_release_mode(mut self, mode: ReleaseMode) -> Self {
        self.move_release_mode = mode;
        self
    }

    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    pub fn get_calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    pub fn get_called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    pub fn get_host(&self) -> &str {
        &self.host
    }

    pub fn get_port(&self) -> u16 {
        self.port
    }

    /// The socket address of the peer.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn get_transfer_syntaxes(&self) -> &[String] {
        &self.transfer_syntaxes
    }

    pub fn get_retrieve_storage_classes(&self) -> &[String] {
        &self.retrieve_storage_classes
    }

    pub fn get_connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn get_response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn get_poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn get_cache_interval(&self) -> Duration {
        self.cache_interval
    }

    pub fn get_move_release_mode(&self) -> ReleaseMode {
        self.move_release_mode
    }

    pub fn get_max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ScuOptions::new();
        assert_eq!(options.get_calling_ae_title(), "THIS-SCU");
        assert_eq!(options.get_called_ae_title(), "ANY-SCP");
        assert_eq!(options.address(), "localhost:104");
        assert_eq!(
            options.get_transfer_syntaxes(),
            &[uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()]
        );
        assert_eq!(options.get_cache_interval(), Duration::from_secs(600));
        assert_eq!(options.get_move_release_mode(), ReleaseMode::Abort);
    }

    #[test]
    fn empty_transfer_syntax_list_is_ignored() {
        let options = ScuOptions::new().transfer_syntaxes(Vec::<String>::new());
        assert_eq!(options.get_transfer_syntaxes().len(), 1);
        let options = ScuOptions::new().transfer_syntaxes([
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
            uids::IMPLICIT_VR_LITTLE_ENDIAN,
        ]);
        assert_eq!(
            options.get_transfer_syntaxes()[0],
            uids::EXPLICIT_VR_LITTLE_ENDIAN
        );
    }
}
