use crate::{config::OciConfig, Error};
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use ring::{
    digest,
    rand::SystemRandom,
    signature::{RsaKeyPair, RSA_PKCS1_SHA256},
};
use std::{fmt, sync::Arc};

/// Signs requests with the OCI HTTP signature scheme (draft-cavage, RSA-SHA256).
#[derive(Clone)]
pub struct RequestSigner {
    key_id: String,
    key: Arc<RsaKeyPair>,
    rng: SystemRandom,
}

// === impl RequestSigner ===

impl RequestSigner {
    pub fn new(key_id: String, pem: &[u8]) -> Result<Self, Error> {
        let key = match rustls_pemfile::read_one(&mut &pem[..])
            .map_err(|e| Error::Config(format!("failed to read private key: {e}")))?
        {
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => {
                RsaKeyPair::from_pkcs8(key.secret_pkcs8_der())
            }
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => {
                RsaKeyPair::from_der(key.secret_pkcs1_der())
            }
            _ => return Err(Error::Config("no RSA private key found".to_string())),
        }
        .map_err(|e| Error::Config(format!("invalid RSA private key: {e}")))?;

        Ok(Self {
            key_id,
            key: Arc::new(key),
            rng: SystemRandom::new(),
        })
    }

    pub fn from_config(config: &OciConfig) -> Result<Self, Error> {
        let pem = std::fs::read(&config.key_file).map_err(|e| {
            Error::Config(format!(
                "failed to read key file {}: {e}",
                config.key_file.display()
            ))
        })?;
        Self::new(config.key_id(), &pem)
    }

    /// Returns the headers to add to the request, including `authorization`.
    pub fn sign(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> Result<Vec<(&'static str, String)>, Error> {
        let headers = signed_headers(method, url, body, now)?;
        let names = headers.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(" ");
        let signing_string = headers
            .iter()
            .map(|(n, v)| format!("{n}: {v}"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut signature = vec![0; self.key.public().modulus_len()];
        self.key
            .sign(
                &RSA_PKCS1_SHA256,
                &self.rng,
                signing_string.as_bytes(),
                &mut signature,
            )
            .map_err(|e| Error::Signing(e.to_string()))?;
        let signature = base64::engine::general_purpose::STANDARD.encode(signature);

        let mut out = headers
            .into_iter()
            .filter(|(n, _)| *n != "(request-target)")
            .collect::<Vec<_>>();
        out.push((
            "authorization",
            format!(
                r#"Signature version="1",keyId="{}",algorithm="rsa-sha256",headers="{names}",signature="{signature}""#,
                self.key_id
            ),
        ));
        Ok(out)
    }
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// The headers covered by the signature, in signing order.
fn signed_headers(
    method: &Method,
    url: &Url,
    body: Option<&[u8]>,
    now: DateTime<Utc>,
) -> Result<Vec<(&'static str, String)>, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Signing(format!("{url} has no host")))?;
    let target = match url.query() {
        Some(q) => format!("{} {}?{}", method.as_str().to_lowercase(), url.path(), q),
        None => format!("{} {}", method.as_str().to_lowercase(), url.path()),
    };

    let mut headers = vec![
        ("date", now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()),
        ("(request-target)", target),
        ("host", host.to_string()),
    ];
    if *method == Method::POST || *method == Method::PUT {
        let body = body.unwrap_or_default();
        let sha = digest::digest(&digest::SHA256, body);
        headers.push((
            "x-content-sha256",
            base64::engine::general_purpose::STANDARD.encode(sha.as_ref()),
        ));
        headers.push(("content-type", "application/json".to_string()));
        headers.push(("content-length", body.len().to_string()));
    }
    Ok(headers)
}
