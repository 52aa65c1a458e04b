//! SOAP 1.1 transport for the vim25 API.

pub mod xml;

use std::time::Duration;

use quick_xml::escape::escape;

use crate::config::ConnectionConfig;
use crate::error::VguestError;
use xml::Element;

const SOAP_ACTION: &str = "urn:vim25/7.0";
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Escape a value for inclusion in element text.
pub fn esc(value: &str) -> std::borrow::Cow<'_, str> {
    escape(value)
}

/// Wrap a method call in a SOAP envelope.
pub fn envelope(method: &str, inner: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
<soapenv:Body>
<{method} xmlns="urn:vim25">{inner}</{method}>
</soapenv:Body>
</soapenv:Envelope>"#
    )
}

/// A SOAP fault returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// vim fault type from the detail element, e.g. `FileNotFound`.
    pub kind: Option<String>,
    pub message: String,
    /// `file` property of file faults.
    pub file: Option<String>,
}

impl Fault {
    fn from_element(fault: &Element) -> Self {
        let message = fault
            .child_text("faultstring")
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown fault")
            .to_string();
        let detail = fault.child("detail").and_then(|d| d.children.first());
        let kind = detail.map(|d| {
            d.attr("xsi:type")
                .map(str::to_string)
                .unwrap_or_else(|| d.name.trim_end_matches("Fault").to_string())
        });
        let file = detail
            .and_then(|d| d.child_text("file"))
            .map(str::to_string);
        Self {
            kind,
            message,
            file,
        }
    }

    pub fn into_error(self) -> VguestError {
        match self.kind.as_deref() {
            Some("FileNotFound") => VguestError::FileNotFound {
                path: self.file.unwrap_or_default(),
            },
            Some(kind) => VguestError::Api {
                message: format!("{kind}: {}", self.message),
            },
            None => VguestError::Api {
                message: self.message,
            },
        }
    }
}

/// Interpret a raw SOAP response body for `method`.
///
/// Returns the `<methodResponse>` element, or the mapped fault.
pub fn parse_response(method: &str, body: &str) -> Result<Element, VguestError> {
    let root = xml::parse(body)?;
    let body_el = root.child("Body").ok_or_else(|| VguestError::Transport {
        message: format!("{method}: response has no SOAP body"),
    })?;

    if let Some(fault) = body_el.child("Fault") {
        return Err(Fault::from_element(fault).into_error());
    }

    let expected = format!("{method}Response");
    body_el
        .child(&expected)
        .cloned()
        .ok_or_else(|| VguestError::Transport {
            message: format!("{method}: missing {expected} element"),
        })
}

/// HTTP client bound to one vim endpoint.
pub struct SoapClient {
    http: reqwest::Client,
    url: String,
    host: String,
}

impl SoapClient {
    pub fn new(config: &ConnectionConfig) -> Result<Self, VguestError> {
        Self::with_endpoint(config, config.sdk_url())
    }

    /// Client for an explicit SDK URL instead of `https://<host>:443/sdk`.
    pub(crate) fn with_endpoint(config: &ConnectionConfig, url: String) -> Result<Self, VguestError> {
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("vguest/", env!("CARGO_PKG_VERSION")));

        if !config.verify_ssl {
            // rustls skips both chain and hostname checks with this flag
            tracing::warn!(host = %config.host, "TLS certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder.build()?;
        Ok(Self {
            http,
            url,
            host: config.host.clone(),
        })
    }

    /// Invoke a vim method. `inner` is the already-escaped argument XML.
    pub async fn call(&self, method: &str, inner: &str) -> Result<Element, VguestError> {
        tracing::debug!(method, "soap call");
        let resp = self
            .http
            .post(&self.url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(envelope(method, inner))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        // Faults arrive as HTTP 500 with a regular envelope.
        match parse_response(method, &body) {
            Err(VguestError::Transport { message }) if !status.is_success() => {
                Err(VguestError::Transport {
                    message: format!("{method}: HTTP {status}: {message}"),
                })
            }
            other => other,
        }
    }

    /// Rewrite the `*` placeholder host in guest transfer URLs.
    pub fn transfer_url(&self, url: &str) -> String {
        rewrite_transfer_url(url, &self.host)
    }

    pub async fn upload(&self, url: &str, content: Vec<u8>) -> Result<(), VguestError> {
        let url = self.transfer_url(url);
        let resp = self.http.put(&url).body(content).send().await?;
        if !resp.status().is_success() {
            return Err(VguestError::Transport {
                message: format!("guest file upload failed: HTTP {}", resp.status()),
            });
        }
        Ok(())
    }

    /// GET a guest file, stopping after `max_lines` lines.
    pub async fn download(&self, url: &str, max_lines: usize) -> Result<Vec<u8>, VguestError> {
        let url = self.transfer_url(url);
        let mut resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(VguestError::Transport {
                message: format!("guest file download failed: HTTP {}", resp.status()),
            });
        }
        let mut lines = LineBuffer::new(max_lines);
        while let Some(chunk) = resp.chunk().await? {
            if !lines.push(&chunk) {
                tracing::debug!(max_lines, "line limit reached, dropping rest of transfer");
                break;
            }
        }
        Ok(lines.into_bytes())
    }
}

/// Bytes up to and including the `max`th newline.
struct LineBuffer {
    buf: Vec<u8>,
    lines_left: usize,
}

impl LineBuffer {
    fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            lines_left: max,
        }
    }

    /// Append a chunk. Returns `false` once the limit is reached.
    fn push(&mut self, chunk: &[u8]) -> bool {
        if self.lines_left == 0 {
            return false;
        }
        for (i, b) in chunk.iter().enumerate() {
            if *b == b'\n' {
                self.lines_left -= 1;
                if self.lines_left == 0 {
                    self.buf.extend_from_slice(&chunk[..=i]);
                    return false;
                }
            }
        }
        self.buf.extend_from_slice(chunk);
        true
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

fn rewrite_transfer_url(url: &str, host: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://*") {
        format!("https://{host}{rest}")
    } else {
        url.to_string()
    }
}
