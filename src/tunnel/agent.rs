//! Tunnel agent — outbound connection from the private network to the relay.
//!
//! Two states. [`Agent::connect`] is *Connecting*: dial the control port and
//! read the one-line subdomain greeting. [`Agent::run`] is *Relaying*: serve
//! HTTP/1.1 requests arriving over the tunnel one at a time, forwarding each
//! to the local server and writing its response back unmodified.
//!
//! Any failure ends the agent. There is no reconnect; restart the process.

use std::sync::Arc;

use axum::http::{
    uri::{Authority, PathAndQuery, Scheme},
    Request, Response, Uri,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::error::AgentError;

/// Longest greeting line accepted from the relay.
const MAX_GREETING_LEN: usize = 253;

type LocalClient = Client<HttpConnector, Incoming>;

/// Where tunneled requests are sent: scheme and authority of the local server.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    scheme: Scheme,
    authority: Authority,
}

impl LocalTarget {
    /// Parse `http://host[:port]`. Only plain HTTP targets without a path
    /// prefix are supported.
    pub fn parse(url: &str) -> Result<Self, AgentError> {
        let invalid = |message: &str| AgentError::InvalidLocal {
            url: url.to_string(),
            message: message.to_string(),
        };

        let uri: Uri = url.parse().map_err(|_| invalid("not a valid URL"))?;
        let scheme = uri.scheme().cloned().ok_or_else(|| invalid("missing scheme"))?;
        if scheme != Scheme::HTTP {
            return Err(invalid("only http:// targets are supported"));
        }
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid("missing host"))?;
        if uri.path_and_query().is_some_and(|pq| pq.as_str() != "/") {
            return Err(invalid("path prefixes are not supported"));
        }
        Ok(Self { scheme, authority })
    }

    /// Point `uri` at the local server, keeping its path and query.
    pub fn rewrite(&self, uri: &Uri) -> Result<Uri, AgentError> {
        let mut parts = uri.clone().into_parts();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(self.authority.clone());
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        Ok(Uri::from_parts(parts)?)
    }
}

impl std::fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// An agent with an established tunnel.
pub struct Agent {
    label: String,
    tunnel: BufReader<TcpStream>,
    local: LocalTarget,
}

impl Agent {
    /// Dial the relay and wait for the assigned subdomain label.
    pub async fn connect(remote: &str, local: LocalTarget) -> Result<Self, AgentError> {
        let stream = TcpStream::connect(remote)
            .await
            .map_err(|source| AgentError::Connect {
                addr: remote.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {e}");
        }

        // Keep the reader: bytes buffered past the newline belong to the first request.
        let mut tunnel = BufReader::new(stream);
        let label = read_greeting(&mut tunnel).await?;

        Ok(Self {
            label,
            tunnel,
            local,
        })
    }

    /// The subdomain label assigned by the relay.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn local(&self) -> &LocalTarget {
        &self.local
    }

    /// Relay requests until the tunnel or the local server fails.
    ///
    /// Never returns `Ok`: a relay hang-up is reported as
    /// [`AgentError::RelayClosed`].
    pub async fn run(self) -> Result<(), AgentError> {
        let client: LocalClient = Client::builder(TokioExecutor::new()).build_http();
        let local = Arc::new(self.local);

        let service = service_fn(move |request| {
            let client = client.clone();
            let local = local.clone();
            async move { forward(&client, &local, request).await }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(self.tunnel), service)
            .await?;

        Err(AgentError::RelayClosed)
    }
}

async fn read_greeting(tunnel: &mut BufReader<TcpStream>) -> Result<String, AgentError> {
    let mut line = String::new();
    let mut limited = (&mut *tunnel).take(MAX_GREETING_LEN as u64 + 2);
    limited
        .read_line(&mut line)
        .await
        .map_err(AgentError::Greeting)?;

    if !line.ends_with('\n') {
        return Err(AgentError::NoGreeting);
    }
    let label = line.trim_end_matches(['\r', '\n']);
    if label.is_empty() || label.len() > MAX_GREETING_LEN {
        return Err(AgentError::NoGreeting);
    }
    Ok(label.to_string())
}

/// Send one tunneled request to the local server.
async fn forward(
    client: &LocalClient,
    local: &LocalTarget,
    mut request: Request<Incoming>,
) -> Result<Response<Incoming>, AgentError> {
    let target = local.rewrite(request.uri())?;
    *request.uri_mut() = target;
    debug!(method = %request.method(), uri = %request.uri(), "Forwarding tunneled request");

    client.request(request).await.map_err(|e| {
        error!("Local server request failed: {e}");
        AgentError::from(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_target_parse() {
        let local = LocalTarget::parse("http://localhost:3000").unwrap();
        assert_eq!(local.to_string(), "http://localhost:3000");
        assert!(LocalTarget::parse("http://localhost:3000/").is_ok());

        assert!(LocalTarget::parse("https://localhost").is_err());
        assert!(LocalTarget::parse("localhost:3000").is_err());
        assert!(LocalTarget::parse("http://localhost/app").is_err());
        assert!(LocalTarget::parse("not a url").is_err());
    }

    #[test]
    fn test_rewrite_keeps_path_and_query() {
        let local = LocalTarget::parse("http://127.0.0.1:8080").unwrap();

        let uri: Uri = "http://lbl.example.com/a/b?c=d".parse().unwrap();
        assert_eq!(
            local.rewrite(&uri).unwrap().to_string(),
            "http://127.0.0.1:8080/a/b?c=d"
        );

        let uri: Uri = "/plain".parse().unwrap();
        assert_eq!(
            local.rewrite(&uri).unwrap().to_string(),
            "http://127.0.0.1:8080/plain"
        );
    }

    #[tokio::test]
    async fn test_connect_reads_label() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"di-bravo-vega-paris\n").await.unwrap();
            sock
        });

        let local = LocalTarget::parse("http://127.0.0.1:1").unwrap();
        let agent = Agent::connect(&addr.to_string(), local).await.unwrap();
        assert_eq!(agent.label(), "di-bravo-vega-paris");
        drop(relay.await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_without_greeting_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });

        let local = LocalTarget::parse("http://127.0.0.1:1").unwrap();
        let err = Agent::connect(&addr.to_string(), local).await.err().unwrap();
        assert!(matches!(err, AgentError::NoGreeting));
    }

    async fn greet_with(line: Vec<u8>) -> Result<Agent, AgentError> {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&line).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let local = LocalTarget::parse("http://127.0.0.1:1").unwrap();
        Agent::connect(&addr.to_string(), local).await
    }

    #[tokio::test]
    async fn test_greeting_length_limit() {
        let mut longest = vec![b'a'; MAX_GREETING_LEN];
        longest.extend_from_slice(b"\r\n");
        let agent = greet_with(longest).await.unwrap();
        assert_eq!(agent.label().len(), MAX_GREETING_LEN);

        let mut too_long = vec![b'a'; MAX_GREETING_LEN + 1];
        too_long.push(b'\n');
        let err = greet_with(too_long).await.err().unwrap();
        assert!(matches!(err, AgentError::NoGreeting));

        let err = greet_with(vec![b'a'; 300]).await.err().unwrap();
        assert!(matches!(err, AgentError::NoGreeting));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let local = LocalTarget::parse("http://127.0.0.1:1").unwrap();
        let err = Agent::connect(&addr.to_string(), local).await.err().unwrap();
        assert!(matches!(err, AgentError::Connect { .. }));
    }
}
