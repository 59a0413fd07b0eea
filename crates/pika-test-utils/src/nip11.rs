use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// What the stub saw of the incoming request.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    /// Lower-cased header names
    pub headers: HashMap<String, String>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// A one-shot HTTP server standing in for a relay's NIP-11 endpoint.
#[derive(Debug)]
pub struct Nip11Stub {
    /// `http://127.0.0.1:<port>`
    pub http_url: String,
    /// The same origin as a `ws://` relay URL
    pub relay_url: String,
    requests: mpsc::Receiver<CapturedRequest>,
}

impl Nip11Stub {
    /// The captured request, once the stub has been hit.
    pub fn request(&self, timeout: Duration) -> Option<CapturedRequest> {
        self.requests.recv_timeout(timeout).ok()
    }
}

/// Serves `document` once with `status_line` (e.g. `"200 OK"`) as
/// `application/nostr+json`, then shuts down.
pub fn spawn_nip11_stub(status_line: &str, document: &str) -> Nip11Stub {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind nip11 stub");
    let addr = listener.local_addr().expect("nip11 stub addr");
    let (tx, requests) = mpsc::channel();
    let response = format!(
        "HTTP/1.1 {status_line}\r\ncontent-type: application/nostr+json\r\naccess-control-allow-origin: *\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{document}",
        document.len(),
    );

    thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        let mut reader = BufReader::new(stream);
        let request = read_head(&mut reader);
        let mut stream = reader.into_inner();
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.flush();
        let _ = tx.send(request);
    });

    Nip11Stub {
        http_url: format!("http://{addr}"),
        relay_url: format!("ws://{addr}"),
        requests,
    }
}

/// NIP-11 fetches are bodiless GETs, so only the head is read.
fn read_head(reader: &mut BufReader<TcpStream>) -> CapturedRequest {
    let mut line = String::new();
    reader.read_line(&mut line).expect("request line");
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or("/").to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    CapturedRequest {
        method,
        path,
        headers,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn stub_serves_document_and_captures_accept() {
        let stub = spawn_nip11_stub("200 OK", r#"{"name":"stub"}"#);
        let mut stream = TcpStream::connect(stub.http_url.trim_start_matches("http://")).unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nAccept: application/nostr+json\r\n\r\n")
            .unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).unwrap();
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
        assert!(resp.contains("application/nostr+json"));
        assert!(resp.ends_with(r#"{"name":"stub"}"#));

        let req = stub.request(Duration::from_secs(1)).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/");
        assert_eq!(req.header("Accept"), Some("application/nostr+json"));
        assert!(stub.relay_url.starts_with("ws://127.0.0.1:"));
    }
}
