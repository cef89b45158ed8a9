//! Abstract and transfer syntaxes accepted by the store receiver.
use dicom_dictionary_std::uids;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

/// Storage SOP classes accepted when not in promiscuous mode.
pub static STORAGE_SOP_CLASSES: &[&str] = &[
    uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::CT_IMAGE_STORAGE,
    uids::ENHANCED_CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::ENHANCED_MR_IMAGE_STORAGE,
    uids::ULTRASOUND_IMAGE_STORAGE,
    uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_WORD_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::X_RAY_ANGIOGRAPHIC_IMAGE_STORAGE,
    uids::X_RAY_RADIOFLUOROSCOPIC_IMAGE_STORAGE,
    uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
    uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    uids::VL_PHOTOGRAPHIC_IMAGE_STORAGE,
    uids::SEGMENTATION_STORAGE,
    uids::GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE,
    uids::BASIC_TEXT_SR_STORAGE,
    uids::ENHANCED_SR_STORAGE,
    uids::COMPREHENSIVE_SR_STORAGE,
    uids::KEY_OBJECT_SELECTION_DOCUMENT_STORAGE,
    uids::ENCAPSULATED_PDF_STORAGE,
    uids::RT_IMAGE_STORAGE,
    uids::RT_DOSE_STORAGE,
    uids::RT_STRUCTURE_SET_STORAGE,
    uids::RT_PLAN_STORAGE,
];

/// The abstract syntaxes to accept:
/// verification plus every storage SOP class.
pub fn abstract_syntaxes() -> Vec<String> {
    std::iter::once(uids::VERIFICATION)
        .chain(STORAGE_SOP_CLASSES.iter().copied())
        .map(String::from)
        .collect()
}

/// The transfer syntaxes to accept, in order of preference.
///
/// With `uncompressed_only`, only the native little endian syntaxes are listed.
/// Otherwise every syntax the registry can decode a data set in is included.
pub fn transfer_syntaxes(uncompressed_only: bool) -> Vec<String> {
    let native = [
        uids::EXPLICIT_VR_LITTLE_ENDIAN,
        uids::IMPLICIT_VR_LITTLE_ENDIAN,
    ];
    let mut out: Vec<String> = native.iter().map(|uid| uid.to_string()).collect();
    if uncompressed_only {
        return out;
    }
    for ts in TransferSyntaxRegistry.iter() {
        if ts.is_unsupported() || native.contains(&ts.uid()) {
            continue;
        }
        out.push(ts.uid().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_is_always_accepted() {
        let syntaxes = abstract_syntaxes();
        assert_eq!(syntaxes[0], uids::VERIFICATION);
        assert_eq!(syntaxes.len(), STORAGE_SOP_CLASSES.len() + 1);
    }

    #[test]
    fn native_syntaxes_come_first() {
        let uncompressed = transfer_syntaxes(true);
        assert_eq!(
            uncompressed,
            vec![
                uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            ]
        );

        let all = transfer_syntaxes(false);
        assert_eq!(all[..2], uncompressed[..]);
        assert!(all.iter().any(|uid| uid == uids::EXPLICIT_VR_BIG_ENDIAN));
        let mut deduped = all.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), all.len());
    }
}
