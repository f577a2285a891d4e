use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufReader, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::error::RpcError;

/// Anything that can make a blocking request/response call to the server.
///
/// The controller only talks to the server through this trait, so workflows can be
/// driven against a recording stand-in.
pub trait RpcCaller {
    fn call(&mut self, method: &str, params: Value) -> Result<Value, RpcError>;
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: [&'a Value; 1],
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<Value>,
}

/// JSON-RPC client over one persistent TCP connection.
///
/// One request is in flight at a time. Any transport failure (timeout, closed socket,
/// unparseable response, mismatched id) closes the client, since the framing of the
/// stream can no longer be trusted; later calls fail with [RpcError::Closed].
#[derive(Debug)]
pub struct RpcClient {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    next_id: u64,
    closed: bool,
}

impl RpcClient {
    /// Connect to the server. `timeout` bounds the connect and every response wait.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, RpcError> {
        let mut last_error = std::io::Error::new(
            ErrorKind::AddrNotAvailable,
            format!("{host}:{port} did not resolve"),
        );
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    log::info!("Connected to RPC server at {addr}");
                    return Self::from_stream(stream, timeout);
                }
                Err(e) => last_error = e,
            }
        }
        Err(RpcError::IOError(last_error))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream, timeout: Duration) -> Result<Self, RpcError> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            writer: stream,
            reader,
            next_id: 0,
            closed: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.writer.shutdown(std::net::Shutdown::Both);
        }
    }

    fn fail(&mut self, error: RpcError) -> RpcError {
        log::error!("{error}");
        self.close();
        error
    }

    fn read_response(&mut self, method: &str) -> Result<Response, RpcError> {
        let mut de = serde_json::Deserializer::from_reader(&mut self.reader);
        Response::deserialize(&mut de).map_err(|e| {
            if e.is_eof() {
                return RpcError::ConnectionClosed(method.to_string());
            }
            match e.io_error_kind() {
                Some(ErrorKind::WouldBlock) | Some(ErrorKind::TimedOut) => {
                    RpcError::Timeout(method.to_string())
                }
                _ => RpcError::MalformedResponse {
                    method: method.to_string(),
                    source: e,
                },
            }
        })
    }
}

impl RpcCaller for RpcClient {
    fn call(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        if self.closed {
            return Err(RpcError::Closed(method.to_string()));
        }
        let id = self.next_id;
        self.next_id += 1;
        log::debug!("SEND {method} {params}");

        let request = serde_json::to_vec(&Request {
            id,
            method,
            params: [&params],
        })
        .map_err(|e| RpcError::Encode {
            method: method.to_string(),
            source: e,
        })?;
        if let Err(e) = self
            .writer
            .write_all(&request)
            .and_then(|_| self.writer.flush())
        {
            return Err(self.fail(RpcError::IOError(e)));
        }

        let response = match self.read_response(method) {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e)),
        };
        if response.id != Some(id) {
            return Err(self.fail(RpcError::IdMismatch {
                expected: id,
                received: response.id,
            }));
        }

        match response.error {
            None | Some(Value::Null) => Ok(response.result),
            Some(Value::String(s)) if s.is_empty() => Ok(response.result),
            Some(error) => {
                let message = match error {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                log::warn!("Server error for {method}: {message}");
                Err(RpcError::Server {
                    method: method.to_string(),
                    params,
                    message,
                })
            }
        }
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    /// A one-connection server answering each request with `reply(request)`
    fn serve<F>(requests: usize, reply: F) -> (u16, JoinHandle<Vec<Value>>)
    where
        F: Fn(&Value) -> Option<Value> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut seen = Vec::new();
            for _ in 0..requests {
                let mut de = serde_json::Deserializer::from_reader(&mut reader);
                let request = match Value::deserialize(&mut de) {
                    Ok(r) => r,
                    Err(_) => break,
                };
                if let Some(response) = reply(&request) {
                    writer
                        .write_all(serde_json::to_string(&response).unwrap().as_bytes())
                        .unwrap();
                }
                seen.push(request);
            }
            seen
        });
        (port, handle)
    }

    #[test]
    fn test_call_round_trip() {
        let (port, server) = serve(2, |req| {
            Some(json!({"id": req["id"], "result": req["params"][0], "error": null}))
        });
        let mut client = RpcClient::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let result = client
            .call("SourceControl.SendAllStatus", json!("dummy"))
            .unwrap();
        assert_eq!(result, json!("dummy"));
        let result = client.call("Echo", json!({"Label": "x"})).unwrap();
        assert_eq!(result, json!({"Label": "x"}));

        let seen = server.join().unwrap();
        assert_eq!(seen[0]["id"], json!(0));
        assert_eq!(seen[1]["id"], json!(1));
        assert_eq!(seen[0]["method"], json!("SourceControl.SendAllStatus"));
        assert_eq!(seen[1]["params"], json!([{"Label": "x"}]));
    }

    #[test]
    fn test_server_error_keeps_connection() {
        let (port, server) = serve(2, |req| {
            if req["method"] == json!("Bad") {
                Some(json!({"id": req["id"], "result": null, "error": "no such channel"}))
            } else {
                Some(json!({"id": req["id"], "result": true, "error": null}))
            }
        });
        let mut client = RpcClient::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        match client.call("Bad", json!({"ChannelIndices": [99]})) {
            Err(RpcError::Server {
                method,
                params,
                message,
            }) => {
                assert_eq!(method, "Bad");
                assert_eq!(params, json!({"ChannelIndices": [99]}));
                assert_eq!(message, "no such channel");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!client.is_closed());
        assert_eq!(client.call("Good", json!(1)).unwrap(), json!(true));
        server.join().unwrap();
    }

    #[test]
    fn test_id_mismatch_closes_client() {
        let (port, server) = serve(1, |_| {
            Some(json!({"id": 77, "result": null, "error": null}))
        });
        let mut client = RpcClient::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let err = client.call("Any", json!(null)).unwrap_err();
        assert!(matches!(
            err,
            RpcError::IdMismatch {
                expected: 0,
                received: Some(77)
            }
        ));
        assert!(err.is_transport());
        assert!(client.is_closed());
        assert!(matches!(
            client.call("Any", json!(null)),
            Err(RpcError::Closed(_))
        ));
        server.join().unwrap();
    }

    #[test]
    fn test_missing_response_times_out() {
        // Hold the connection open well past the client timeout without answering
        let (port, server) = serve(1, |_| {
            std::thread::sleep(Duration::from_millis(800));
            None
        });
        let timeout = Duration::from_millis(200);
        let mut client = RpcClient::connect("127.0.0.1", port, timeout).unwrap();
        let start = std::time::Instant::now();
        let err = client.call("Slow", json!(null)).unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)), "unexpected {err:?}");
        assert!(start.elapsed() < Duration::from_millis(700));
        assert!(client.is_closed());
        server.join().unwrap();
    }
}
