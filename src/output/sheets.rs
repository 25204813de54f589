use anyhow::{bail, Context, Result};
use log::{debug, info};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::env;
use url::Url;

use crate::compare::Table;

/// Publishes comparison tables as a shareable spreadsheet.
pub trait SheetUploader {
    /// Creates a sheet named `title` and returns its URL.
    fn create_sheet(&self, title: &str, tables: &[Table]) -> Result<String>;
}

#[derive(Serialize)]
struct SheetRequest<'a> {
    title: &'a str,
    tables: &'a [Table],
}

#[derive(Deserialize)]
struct SheetResponse {
    url: String,
}

/// Posts the tables as JSON to a sheet service, which answers with
/// `{"url": ...}`.
pub struct HttpSheetUploader {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpSheetUploader {
    /// Resolves the endpoint and credentials up front so that a
    /// misconfiguration fails before any benchmark runs.
    pub fn new(endpoint: &str, token_env: Option<&str>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid sheets endpoint {endpoint:?}"))?;
        let token = match token_env {
            Some(var) => match env::var(var) {
                Ok(token) if !token.is_empty() => Some(token),
                _ => bail!("No sheets credentials: ${var} is not set"),
            },
            None => None,
        };
        Ok(Self {
            client: Client::new(),
            endpoint,
            token,
        })
    }
}

impl SheetUploader for HttpSheetUploader {
    fn create_sheet(&self, title: &str, tables: &[Table]) -> Result<String> {
        info!("Uploading {} tables to {}", tables.len(), self.endpoint);
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .json(&SheetRequest { title, tables });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .with_context(|| format!("Failed to reach sheets endpoint {}", self.endpoint))?
            .error_for_status()
            .context("Sheets endpoint rejected the upload")?;
        let body = response
            .text()
            .context("Failed to read response from sheets endpoint")?;
        let sheet: SheetResponse = serde_json::from_str(&body)
            .with_context(|| format!("Invalid response from sheets endpoint: {body}"))?;
        debug!("Created sheet {title:?} at {}", sheet.url);
        Ok(sheet.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::{Change, Row};
    use serial_test::serial;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Accepts a single request, sends it back over the channel and replies
    /// with `status` and `body`.
    fn serve_once(status: &'static str, body: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&request) {
                    break;
                }
            }
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            tx.send(String::from_utf8_lossy(&request).into_owned()).unwrap();
        });
        (format!("http://{addr}/sheets"), rx)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        body.len() >= length
    }

    fn tables() -> Vec<Table> {
        vec![Table {
            metric: "time/op".into(),
            unit: "ns/op".into(),
            rows: vec![Row {
                benchmark: "Encode-8".into(),
                old: "1.23E+03".into(),
                new: "1.20E+03".into(),
                delta: "-2.44%".into(),
                pct_delta: -2.44,
                change: Change::Better,
                note: "p=0.008 n=5+5".into(),
            }],
        }]
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(HttpSheetUploader::new("not a url", None).is_err());
    }

    #[test]
    #[serial]
    fn test_missing_token() {
        env::remove_var("BENCHDIFF_TEST_SHEETS_TOKEN");
        let err = HttpSheetUploader::new("http://127.0.0.1:1/", Some("BENCHDIFF_TEST_SHEETS_TOKEN"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("BENCHDIFF_TEST_SHEETS_TOKEN"));
    }

    #[test]
    #[serial]
    fn test_create_sheet() {
        let (endpoint, requests) = serve_once("200 OK", r#"{"url":"https://sheets.example/d/1"}"#);
        env::set_var("BENCHDIFF_TEST_SHEETS_TOKEN", "s3cret");
        let uploader =
            HttpSheetUploader::new(&endpoint, Some("BENCHDIFF_TEST_SHEETS_TOKEN")).unwrap();
        env::remove_var("BENCHDIFF_TEST_SHEETS_TOKEN");

        let url = uploader
            .create_sheet("benchdiff: ./pkg/kv (aaa -> bbb)", &tables())
            .unwrap();
        assert_eq!(url, "https://sheets.example/d/1");

        let request = requests.recv().unwrap();
        assert!(request.starts_with("POST /sheets "), "{request}");
        assert!(request.to_lowercase().contains("authorization: bearer s3cret"));
        assert!(request.contains(r#""title":"benchdiff: ./pkg/kv (aaa -> bbb)""#));
        assert!(request.contains(r#""benchmark":"Encode-8""#));
    }

    #[test]
    fn test_create_sheet_rejected() {
        let (endpoint, _requests) = serve_once("403 Forbidden", "{}");
        let uploader = HttpSheetUploader::new(&endpoint, None).unwrap();
        let err = uploader.create_sheet("title", &tables()).unwrap_err();
        assert!(format!("{err:#}").contains("rejected"), "{err:#}");
    }
}
