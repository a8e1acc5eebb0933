//! DKIM signing for relayed mail (RFC 6376, rsa-sha256, relaxed/relaxed)

use super::keys::parse_private_key;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mailtrust_common::{Error, Result};
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Signing parameters bound to one domain
#[derive(Debug, Clone)]
pub struct DkimSigningConfig {
    /// `d=` tag
    pub domain: String,
    /// `s=` tag
    pub selector: String,
    /// Headers covered by the signature, in signing order
    pub headers_to_sign: Vec<String>,
}

impl DkimSigningConfig {
    /// Sign the usual originator headers
    pub fn new(domain: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            selector: selector.into(),
            headers_to_sign: ["from", "to", "subject", "date", "message-id", "mime-version", "content-type"]
                .iter()
                .map(|h| h.to_string())
                .collect(),
        }
    }
}

/// Signs outgoing messages with a domain's stored private key
pub struct DkimSigner {
    config: DkimSigningConfig,
    signing_key: SigningKey<Sha256>,
}

impl std::fmt::Debug for DkimSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkimSigner")
            .field("domain", &self.config.domain)
            .field("selector", &self.config.selector)
            .finish_non_exhaustive()
    }
}

impl DkimSigner {
    /// Build a signer from a PEM private key (PKCS#8 or PKCS#1)
    pub fn new(config: DkimSigningConfig, private_key_pem: &str) -> Result<Self> {
        let private_key = parse_private_key(private_key_pem)?;
        Ok(Self {
            config,
            signing_key: SigningKey::<Sha256>::new(private_key),
        })
    }

    /// Compute the `DKIM-Signature` header value for `message`
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        self.sign_at(message, chrono::Utc::now().timestamp())
    }

    /// Return `message` with a `DKIM-Signature` header prepended
    pub fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>> {
        let value = self.sign(message)?;
        let mut signed = Vec::with_capacity(message.len() + value.len() + 20);
        signed.extend_from_slice(b"DKIM-Signature: ");
        signed.extend_from_slice(value.as_bytes());
        signed.extend_from_slice(b"\r\n");
        signed.extend_from_slice(message);
        Ok(signed)
    }

    fn sign_at(&self, message: &[u8], timestamp: i64) -> Result<String> {
        let (headers, body) = split_message(message)?;

        let body_hash = BASE64.encode(Sha256::digest(canonicalize_body(&body)));

        let signed_headers: Vec<&str> = self
            .config
            .headers_to_sign
            .iter()
            .map(|h| h.as_str())
            .filter(|h| headers.contains_key(&h.to_ascii_lowercase()))
            .collect();

        if !signed_headers.iter().any(|h| h.eq_ignore_ascii_case("from")) {
            return Err(Error::Crypto("Message has no From header to sign".to_string()));
        }

        let mut header_value = format!(
            "v=1; a=rsa-sha256; c=relaxed/relaxed; d={}; s={}; t={}; h={}; bh={}; b=",
            self.config.domain,
            self.config.selector,
            timestamp,
            signed_headers.join(":"),
            body_hash
        );

        let data = canonicalize_headers(&headers, &signed_headers, &header_value);
        let signature = self.signing_key.sign(data.as_bytes());
        header_value.push_str(&BASE64.encode(signature.to_bytes().as_ref()));

        Ok(header_value)
    }
}

/// Split a message into lower-cased, unfolded headers and the body
fn split_message(message: &[u8]) -> Result<(HashMap<String, String>, String)> {
    let text = String::from_utf8_lossy(message);
    let (header_section, body) = text
        .split_once("\r\n\r\n")
        .or_else(|| text.split_once("\n\n"))
        .ok_or_else(|| Error::Crypto("Could not find header/body separator".to_string()))?;

    let mut headers = HashMap::new();
    let mut current: Option<(String, String)> = None;

    for line in header_section.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            if let Some((name, value)) = current.take() {
                headers.insert(name, value);
            }
            current = Some((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    if let Some((name, value)) = current {
        headers.insert(name, value);
    }

    Ok((headers, body.to_string()))
}

/// Relaxed body: runs of WSP become one space, trailing WSP and trailing
/// empty lines are dropped. An empty body stays empty.
fn canonicalize_body(body: &str) -> Vec<u8> {
    let mut lines: Vec<String> = body.lines().map(relaxed_body_line).collect();

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    if lines.is_empty() {
        return Vec::new();
    }

    let mut out = lines.join("\r\n");
    out.push_str("\r\n");
    out.into_bytes()
}

fn relaxed_body_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_wsp = false;
    for c in line.chars() {
        if c == ' ' || c == '\t' {
            if !in_wsp {
                out.push(' ');
                in_wsp = true;
            }
        } else {
            out.push(c);
            in_wsp = false;
        }
    }
    out.truncate(out.trim_end_matches(' ').len());
    out
}

fn canonicalize_headers(
    headers: &HashMap<String, String>,
    signed_headers: &[&str],
    dkim_value: &str,
) -> String {
    let mut out = String::new();

    for name in signed_headers {
        if let Some(value) = headers.get(&name.to_ascii_lowercase()) {
            out.push_str(&canonical_header(name, value));
            out.push_str("\r\n");
        }
    }
    // The signature header itself goes last, without its trailing CRLF
    out.push_str(&canonical_header("DKIM-Signature", dkim_value));
    out
}

fn canonical_header(name: &str, value: &str) -> String {
    format!(
        "{}:{}",
        name.to_ascii_lowercase(),
        value.split_whitespace().collect::<Vec<_>>().join(" ")
    )
}
