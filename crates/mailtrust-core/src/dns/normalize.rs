//! TXT comparison normalization

/// Strip quotes, collapse whitespace runs to one space, trim, lowercase
pub fn normalize_txt(value: &str) -> String {
    value
        .replace('"', "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DKIM: &str = "v=DKIM1; k=rsa; p=MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAz";

    #[test]
    fn test_normalize_variants() {
        let variants = [
            DKIM.to_string(),
            format!("\"{}\"", DKIM),
            DKIM.to_uppercase(),
            DKIM.replace(' ', "   "),
            DKIM.replace("; ", ";\t "),
            format!("  {}\n", DKIM),
        ];
        let expected = normalize_txt(DKIM);
        for v in &variants {
            assert_eq!(normalize_txt(v), expected, "variant {:?}", v);
        }
    }

    #[test]
    fn test_normalize_idempotent() {
        let variants = [
            DKIM.to_string(),
            format!("\"{}\" \"extra\"", DKIM),
            DKIM.to_uppercase().replace(' ', "\t\t"),
            String::new(),
            "   ".to_string(),
        ];
        for v in &variants {
            let once = normalize_txt(v);
            assert_eq!(normalize_txt(&once), once);
        }
    }
}
