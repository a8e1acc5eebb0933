//! DKIM key material, outbound signing and inbound key-match validation

pub mod keys;
pub mod signer;
pub mod validator;

pub use keys::{
    chunk_for_txt, generate_key_pair, join_txt_chunks, public_key_from_private_pem,
    render_txt_chunks, KeyMaterial, TXT_CHUNK_LEN,
};
pub use signer::{DkimSigner, DkimSigningConfig};
pub use validator::{DkimCheck, DkimOutcome, InboundDkimValidator};

/// Extract a tag value from a `tag=value; tag=value` list
pub(crate) fn tag_value<'a>(list: &'a str, tag: &str) -> Option<&'a str> {
    list.split(';').find_map(|part| {
        let (name, value) = part.split_once('=')?;
        if name.trim().eq_ignore_ascii_case(tag) {
            Some(value.trim())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_value() {
        let record = "v=DKIM1; k=rsa; p=MIIBIjAN";
        assert_eq!(tag_value(record, "p"), Some("MIIBIjAN"));
        assert_eq!(tag_value(record, "K"), Some("rsa"));
        assert_eq!(tag_value(record, "t"), None);
    }
}
