// BLOB version prefix helpers. [version: u8][wincode payload].
// Each payload kind has its own version byte so it can evolve independently.

pub(crate) const HISTOGRAM_VERSION: u8 = 1;
pub(crate) const TRACE_VERSION: u8 = 1;
pub(crate) const QUERY_TEXTS_VERSION: u8 = 1;
pub(crate) const SYSTEM_INFO_VERSION: u8 = 1;
pub(crate) const AGENT_CONFIG_VERSION: u8 = 1;

pub(crate) fn with_version_prefix(version: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(version);
    out.extend_from_slice(&payload);
    out
}

/// Payload after the version byte, or `None` if the blob is empty or of another version.
pub(crate) fn blob_payload(bytes: &[u8], expected_version: u8) -> Option<&[u8]> {
    match bytes.split_first() {
        Some((version, rest)) if *version == expected_version => Some(rest),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_roundtrip_and_version_mismatch() {
        let blob = with_version_prefix(HISTOGRAM_VERSION, vec![9, 8, 7]);
        assert_eq!(blob, vec![HISTOGRAM_VERSION, 9, 8, 7]);
        assert_eq!(blob_payload(&blob, HISTOGRAM_VERSION), Some(&[9u8, 8, 7][..]));
        assert_eq!(blob_payload(&blob, HISTOGRAM_VERSION + 1), None);
        assert_eq!(blob_payload(&[], HISTOGRAM_VERSION), None);
    }
}
