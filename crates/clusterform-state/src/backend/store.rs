//! Object stores for the remote backend

use crate::error::{Result, StateError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Minimal key/value object store
///
/// Keys are `/`-separated paths. `put_if_absent` must be atomic for the
/// remote backend's lock to exclude concurrent writers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Write only when `key` does not exist; `false` when it already did
    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool>;

    /// Remove `key`; removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove `key` only while it still holds exactly `expected`
    ///
    /// `false` when the object changed or is gone. Must be atomic for a
    /// broken stale lock never to take a fresh lock with it.
    async fn delete_if_matches(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Immediate children of the directory `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<StoreEntry>>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Object,
    Directory,
}

/// In-process store; clones share the same objects
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys currently stored
    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        let mut objects = self.objects.lock().await;
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().await.remove(key);
        Ok(())
    }

    async fn delete_if_matches(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut objects = self.objects.lock().await;
        if objects.get(key).map(Vec::as_slice) != Some(expected) {
            return Ok(false);
        }
        objects.remove(key);
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoreEntry>> {
        let dir = directory_prefix(prefix);
        let objects = self.objects.lock().await;
        let mut entries: BTreeMap<String, EntryKind> = BTreeMap::new();
        for key in objects.keys() {
            let Some(rest) = key.strip_prefix(&dir).filter(|rest| !rest.is_empty()) else {
                continue;
            };
            match rest.split_once('/') {
                Some((child, _)) => {
                    entries.insert(child.to_string(), EntryKind::Directory);
                }
                None => {
                    entries
                        .entry(rest.to_string())
                        .or_insert(EntryKind::Object);
                }
            }
        }
        Ok(entries
            .into_iter()
            .map(|(name, kind)| StoreEntry { name, kind })
            .collect())
    }
}

/// `a/b` -> `a/b/`, `` -> ``
fn directory_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Object store reached over plain HTTP verbs
///
/// Objects live at `<base_url>/<key>`. Directory listings are read with a
/// `GET` on `<base_url>/<prefix>/` returning newline-delimited JSON entries
/// (`{"name": "...", "type": "directory"}`). Exclusive creation relies on the
/// server honouring `If-None-Match: *`, and conditional deletion on it
/// sending an `ETag` and honouring `If-Match`. A server that ignores these
/// headers gives no protection against concurrent writers.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, token)
    }

    /// Use a preconfigured client (proxies, timeouts, TLS roots)
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn unexpected(method: &str, url: &str, status: StatusCode) -> StateError {
    StateError::Store(format!("{} {} returned {}", method, url, status))
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self.url(key);
        tracing::debug!("GET {}", url);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            status => Err(unexpected("GET", &url, status)),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let url = self.url(key);
        tracing::debug!("PUT {} ({} bytes)", url, bytes.len());
        let response = self
            .request(reqwest::Method::PUT, &url)
            .body(bytes.to_vec())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(unexpected("PUT", &url, response.status()));
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        let url = self.url(key);
        tracing::debug!("PUT {} if absent", url);
        let response = self
            .request(reqwest::Method::PUT, &url)
            .header(reqwest::header::IF_NONE_MATCH, "*")
            .body(bytes.to_vec())
            .send()
            .await?;
        match response.status() {
            StatusCode::PRECONDITION_FAILED => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(unexpected("PUT", &url, status)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.url(key);
        tracing::debug!("DELETE {}", url);
        let response = self.request(reqwest::Method::DELETE, &url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(unexpected("DELETE", &url, status)),
        }
    }

    async fn delete_if_matches(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let url = self.url(key);
        tracing::debug!("DELETE {} if unchanged", url);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Ok(false),
            status if status.is_success() => {}
            status => return Err(unexpected("GET", &url, status)),
        }
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        if response.bytes().await?.as_ref() != expected {
            return Ok(false);
        }

        let request = self.request(reqwest::Method::DELETE, &url);
        let request = match &etag {
            Some(etag) => request.header(reqwest::header::IF_MATCH, etag),
            None => {
                tracing::warn!("{} sent no ETag; deleting it unconditionally", url);
                request
            }
        };
        let response = request.send().await?;
        match response.status() {
            StatusCode::PRECONDITION_FAILED | StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(unexpected("DELETE", &url, status)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoreEntry>> {
        let url = self.url(&directory_prefix(prefix));
        tracing::debug!("LIST {}", url);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(unexpected("GET", &url, status));
        }
        let body = response.text().await?;
        parse_listing(&body)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let url = self.url(key);
        let response = self.request(reqwest::Method::HEAD, &url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(unexpected("HEAD", &url, status)),
        }
    }
}

fn parse_listing(body: &str) -> Result<Vec<StoreEntry>> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| StateError::Store(format!("invalid listing entry '{}': {}", line, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_put_if_absent() {
        let store = MemoryObjectStore::new();
        assert!(store.put_if_absent("a/lock.json", b"1").await.unwrap());
        assert!(!store.put_if_absent("a/lock.json", b"2").await.unwrap());
        assert_eq!(store.get("a/lock.json").await.unwrap(), Some(b"1".to_vec()));

        store.delete("a/lock.json").await.unwrap();
        store.delete("a/lock.json").await.unwrap();
        assert!(!store.exists("a/lock.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_list() {
        let store = MemoryObjectStore::new();
        store.put("root/one/main.tf.json", b"{}").await.unwrap();
        store.put("root/one/lock.json", b"{}").await.unwrap();
        store.put("root/two/main.tf.json", b"{}").await.unwrap();
        store.put("root/readme", b"").await.unwrap();
        store.put("rootless/x", b"").await.unwrap();

        let entries = store.list("/root/").await.unwrap();
        assert_eq!(
            entries,
            vec![
                StoreEntry {
                    name: "one".to_string(),
                    kind: EntryKind::Directory
                },
                StoreEntry {
                    name: "readme".to_string(),
                    kind: EntryKind::Object
                },
                StoreEntry {
                    name: "two".to_string(),
                    kind: EntryKind::Directory
                },
            ]
        );
        assert_eq!(store.list("").await.unwrap().len(), 2);
        assert!(store.list("missing").await.unwrap().is_empty());
    }

    #[test]
    fn test_parse_listing() {
        let body = "{\"name\":\"prod\",\"type\":\"directory\"}\n\n{\"name\":\"notes\",\"type\":\"object\"}\n";
        let entries = parse_listing(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert!(parse_listing("{\"name\":1}").is_err());
    }

    #[tokio::test]
    async fn test_memory_store_delete_if_matches() {
        let store = MemoryObjectStore::new();
        store.put("a/lock.json", b"mine").await.unwrap();
        assert!(!store.delete_if_matches("a/lock.json", b"theirs").await.unwrap());
        assert!(store.delete_if_matches("a/lock.json", b"mine").await.unwrap());
        assert!(!store.delete_if_matches("a/lock.json", b"mine").await.unwrap());
    }

    #[test]
    fn test_http_url() {
        let store = HttpObjectStore::new("https://objects.example.com/stor/", None);
        assert_eq!(
            store.url("/clusterform/prod/main.tf.json"),
            "https://objects.example.com/stor/clusterform/prod/main.tf.json"
        );
    }

    mod http {
        use super::*;
        use crate::backend::{Backend, RemoteBackend};
        use std::net::SocketAddr;
        use std::sync::Mutex as StdMutex;
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
        use tokio::net::{TcpListener, TcpStream};

        const TOKEN: &str = "secret";

        type Headers = BTreeMap<String, String>;

        /// Object server speaking just enough HTTP for `HttpObjectStore`
        #[derive(Default)]
        struct Server {
            objects: StdMutex<BTreeMap<String, (Vec<u8>, u64)>>,
            version: StdMutex<u64>,
            requests: StdMutex<Vec<String>>,
            send_etag: bool,
        }

        struct Reply {
            status: u16,
            headers: Vec<(&'static str, String)>,
            body: Vec<u8>,
        }

        impl Reply {
            fn status(status: u16) -> Self {
                Self {
                    status,
                    headers: Vec::new(),
                    body: Vec::new(),
                }
            }
        }

        impl Server {
            fn handle(&self, method: &str, path: &str, headers: &Headers, body: Vec<u8>) -> Reply {
                self.requests
                    .lock()
                    .unwrap()
                    .push(format!("{} {}", method, path));
                let expected = format!("Bearer {}", TOKEN);
                if headers.get("authorization") != Some(&expected) {
                    return Reply::status(401);
                }

                let key = path.trim_start_matches('/').to_string();
                let mut objects = self.objects.lock().unwrap();
                if key.ends_with('/') {
                    return listing(&objects, &key);
                }
                let etag = objects.get(&key).map(|(_, v)| format!("\"v{}\"", v));

                match method {
                    "GET" | "HEAD" => match objects.get(&key) {
                        Some((bytes, _)) => {
                            let mut reply = Reply::status(200);
                            reply.body = bytes.clone();
                            if let Some(etag) = etag.filter(|_| self.send_etag) {
                                reply.headers.push(("ETag", etag));
                            }
                            reply
                        }
                        None => Reply::status(404),
                    },
                    "PUT" => {
                        if headers.get("if-none-match").map(String::as_str) == Some("*")
                            && etag.is_some()
                        {
                            return Reply::status(412);
                        }
                        let mut version = self.version.lock().unwrap();
                        *version += 1;
                        objects.insert(key, (body, *version));
                        Reply::status(201)
                    }
                    "DELETE" => {
                        if let Some(expected) = headers.get("if-match")
                            && etag.as_ref() != Some(expected)
                        {
                            return Reply::status(412);
                        }
                        match objects.remove(&key) {
                            Some(_) => Reply::status(204),
                            None => Reply::status(404),
                        }
                    }
                    _ => Reply::status(405),
                }
            }
        }

        fn listing(objects: &BTreeMap<String, (Vec<u8>, u64)>, dir: &str) -> Reply {
            let mut children = BTreeMap::new();
            for key in objects.keys() {
                if let Some(rest) = key.strip_prefix(dir) {
                    match rest.split_once('/') {
                        Some((child, _)) => children.insert(child.to_string(), "directory"),
                        None => children.insert(rest.to_string(), "object"),
                    };
                }
            }
            if children.is_empty() {
                return Reply::status(404);
            }
            let mut reply = Reply::status(200);
            reply.body = children
                .iter()
                .map(|(name, kind)| format!("{{\"name\":\"{}\",\"type\":\"{}\"}}\n", name, kind))
                .collect::<String>()
                .into_bytes();
            reply
        }

        async fn serve_one(stream: TcpStream, server: Arc<Server>) -> std::io::Result<()> {
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);

            let mut request_line = String::new();
            reader.read_line(&mut request_line).await?;
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let path = parts.next().unwrap_or_default().to_string();

            let mut headers = Headers::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await?;
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                }
            }
            let length = headers
                .get("content-length")
                .and_then(|value| value.parse().ok())
                .unwrap_or(0);
            let mut body = vec![0; length];
            reader.read_exact(&mut body).await?;

            let reply = server.handle(&method, &path, &headers, body);
            let mut head = format!(
                "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n",
                reply.status,
                reply.body.len()
            );
            for (name, value) in &reply.headers {
                head.push_str(&format!("{}: {}\r\n", name, value));
            }
            head.push_str("\r\n");
            write.write_all(head.as_bytes()).await?;
            if method != "HEAD" {
                write.write_all(&reply.body).await?;
            }
            write.shutdown().await
        }

        async fn start(send_etag: bool) -> (SocketAddr, Arc<Server>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let server = Arc::new(Server {
                send_etag,
                ..Server::default()
            });
            let shared = server.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let server = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_one(stream, server).await {
                            eprintln!("test server: {}", e);
                        }
                    });
                }
            });
            (addr, server)
        }

        fn client() -> reqwest::Client {
            reqwest::Client::builder().no_proxy().build().unwrap()
        }

        fn store(addr: SocketAddr) -> HttpObjectStore {
            HttpObjectStore::with_client(
                client(),
                format!("http://{}/stor/", addr),
                Some(TOKEN.to_string()),
            )
        }

        #[tokio::test]
        async fn test_get_put_delete() {
            let (addr, server) = start(true).await;
            let store = store(addr);

            assert_eq!(store.get("cf/prod/main.tf.json").await.unwrap(), None);
            assert!(!store.exists("cf/prod/main.tf.json").await.unwrap());

            store.put("cf/prod/main.tf.json", b"{}\n").await.unwrap();
            assert_eq!(
                store.get("cf/prod/main.tf.json").await.unwrap(),
                Some(b"{}\n".to_vec())
            );
            assert!(store.exists("cf/prod/main.tf.json").await.unwrap());

            store.delete("cf/prod/main.tf.json").await.unwrap();
            // deleting again is not an error
            store.delete("cf/prod/main.tf.json").await.unwrap();

            let requests = server.requests.lock().unwrap().clone();
            assert_eq!(requests[0], "GET /stor/cf/prod/main.tf.json");
            assert!(requests.contains(&"HEAD /stor/cf/prod/main.tf.json".to_string()));
        }

        #[tokio::test]
        async fn test_put_if_absent_precondition() {
            let (addr, _server) = start(true).await;
            let store = store(addr);

            assert!(store.put_if_absent("cf/prod/lock.json", b"first").await.unwrap());
            assert!(!store.put_if_absent("cf/prod/lock.json", b"second").await.unwrap());
            assert_eq!(
                store.get("cf/prod/lock.json").await.unwrap(),
                Some(b"first".to_vec())
            );
        }

        #[tokio::test]
        async fn test_delete_if_matches_with_etag() {
            let (addr, _server) = start(true).await;
            let store = store(addr);

            assert!(!store.delete_if_matches("cf/prod/lock.json", b"a").await.unwrap());
            store.put("cf/prod/lock.json", b"a").await.unwrap();
            assert!(!store.delete_if_matches("cf/prod/lock.json", b"b").await.unwrap());
            assert!(store.delete_if_matches("cf/prod/lock.json", b"a").await.unwrap());
            assert_eq!(store.get("cf/prod/lock.json").await.unwrap(), None);
        }

        #[tokio::test]
        async fn test_delete_if_matches_without_etag() {
            let (addr, _server) = start(false).await;
            let store = store(addr);

            store.put("cf/prod/lock.json", b"a").await.unwrap();
            assert!(store.delete_if_matches("cf/prod/lock.json", b"a").await.unwrap());
        }

        #[tokio::test]
        async fn test_list_directories() {
            let (addr, _server) = start(true).await;
            let store = store(addr);

            assert!(store.list("cf").await.unwrap().is_empty());
            store.put("cf/prod/main.tf.json", b"{}").await.unwrap();
            store.put("cf/notes", b"").await.unwrap();

            let entries = store.list("/cf/").await.unwrap();
            assert_eq!(
                entries,
                vec![
                    StoreEntry {
                        name: "notes".to_string(),
                        kind: EntryKind::Object
                    },
                    StoreEntry {
                        name: "prod".to_string(),
                        kind: EntryKind::Directory
                    },
                ]
            );
        }

        #[tokio::test]
        async fn test_missing_token_rejected() {
            let (addr, _server) = start(true).await;
            let anonymous =
                HttpObjectStore::with_client(client(), format!("http://{}/stor", addr), None);

            let err = anonymous.get("cf/prod/main.tf.json").await.unwrap_err();
            assert!(matches!(err, StateError::Store(_)));
            assert!(err.to_string().contains("401"));
        }

        #[tokio::test]
        async fn test_remote_backend_over_http() {
            let (addr, _server) = start(true).await;
            let backend = RemoteBackend::new(store(addr), "cf");

            let lock = backend.acquire_lock("prod").await.unwrap();
            assert!(matches!(
                backend.acquire_lock("prod").await,
                Err(StateError::Lock(_))
            ));
            backend.persist_state("prod", b"{}\n", &lock).await.unwrap();
            backend.release_lock("prod", &lock).await.unwrap();

            assert_eq!(backend.load("prod").await.unwrap(), b"{}\n");
            assert_eq!(backend.list().await.unwrap(), vec!["prod"]);
            assert!(backend.load("staging").await.unwrap_err().is_not_found());
        }
    }
}
