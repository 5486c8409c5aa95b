#![allow(dead_code)]

use flate2::{write::GzEncoder, Compression};
use std::{
    collections::HashMap,
    net::{SocketAddr, TcpListener as StdTcpListener},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Canned response for one path
#[derive(Clone, Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Send only the first half of the body, then hang
    pub stall: bool,
}

impl Reply {
    pub fn ok<B: Into<Vec<u8>>>(body: B) -> Self {
        Reply {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
            stall: false,
        }
    }

    pub fn stalled<B: Into<Vec<u8>>>(body: B) -> Self {
        Reply {
            stall: true,
            ..Reply::ok(body)
        }
    }

    pub fn status(status: u16) -> Self {
        Reply {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            stall: false,
        }
    }

    pub fn redirect(location: &str) -> Self {
        Reply {
            status: 302,
            headers: vec![("Location".to_string(), location.to_string())],
            body: Vec::new(),
            stall: false,
        }
    }
}

/// Minimal HTTP/1.1 responder on a random loopback port, one request per
/// connection, counting every request by path
#[derive(Clone)]
pub struct TestServer {
    pub addr: SocketAddr,
    routes: Arc<Mutex<HashMap<String, Reply>>>,
    hits: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub async fn start() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = TestServer {
            addr: listener.local_addr().unwrap(),
            routes: Arc::new(Mutex::new(HashMap::new())),
            hits: Arc::new(Mutex::new(Vec::new())),
        };
        let accept = server.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = accept.clone();
                tokio::spawn(async move {
                    let _ = conn.serve(stream).await;
                });
            }
        });
        server
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn route(&self, path: &str, reply: Reply) {
        self.routes.lock().unwrap().insert(path.to_string(), reply);
    }

    pub fn hits(&self) -> usize {
        self.hits.lock().unwrap().len()
    }

    pub fn hits_for(&self, path: &str) -> usize {
        self.hits.lock().unwrap().iter().filter(|p| *p == path).count()
    }

    async fn serve(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let len = stream.read(&mut buf).await?;
            if len == 0 {
                return Ok(());
            }
            request.extend_from_slice(&buf[..len]);
        }
        let head = String::from_utf8_lossy(&request);
        let path = head
            .split_whitespace()
            .nth(1)
            .unwrap_or("/")
            .to_string();
        self.hits.lock().unwrap().push(path.clone());

        let reply = self
            .routes
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .unwrap_or_else(|| Reply::status(404));
        let mut response = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
            reply.status,
            reason(reply.status),
            reply.body.len()
        );
        for (key, value) in &reply.headers {
            response.push_str(&format!("{}: {}\r\n", key, value));
        }
        response.push_str("\r\n");
        stream.write_all(response.as_bytes()).await?;
        if reply.stall {
            stream.write_all(&reply.body[..reply.body.len() / 2]).await?;
            stream.flush().await?;
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            return Ok(());
        }
        stream.write_all(&reply.body).await?;
        stream.shutdown().await
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        302 => "Found",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// A loopback port nothing is listening on, at least for now
pub fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Build a gzip compressed tar archive from `(path, contents)` pairs
pub fn layer_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Archive with one empty regular file whose stored name is used verbatim,
/// bypassing the path checks in [tar::Builder]
pub fn raw_name_archive(name: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut header = tar::Header::new_gnu();
    header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
    header.set_size(0);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder.append(&header, std::io::empty()).unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

/// Every file, link and directory below `dir`
pub fn count_entries(dir: &Path) -> usize {
    let mut count = 0;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            count += 1;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                count += count_entries(&entry.path());
            }
        }
    }
    count
}

/// Files that make a root filesystem count as provisioned
pub fn marker_files() -> Vec<(&'static str, &'static str)> {
    vec![
        ("usr/bin/node", "#!/bin/sh\n"),
        ("usr/local/lib/gateway/gateway.mjs", "export {}\n"),
    ]
}

pub fn not_an_archive() -> Vec<u8> {
    b"this is not a gzip stream at all".to_vec()
}

/// Sandbox engine stand-in: skips the engine flags and runs the wrapped
/// `/usr/bin/env -i ...` command directly on the host
pub fn fake_proot() -> PathBuf {
    static SCRIPT: OnceLock<PathBuf> = OnceLock::new();
    SCRIPT
        .get_or_init(|| {
            let dir = tempfile::tempdir().unwrap().into_path();
            let path = dir.join("fake-proot");
            std::fs::write(
                &path,
                concat!(
                    "#!/bin/sh\n",
                    "while [ $# -gt 0 ]; do\n",
                    "  if [ \"$1\" = /usr/bin/env ]; then exec \"$@\"; fi\n",
                    "  shift\n",
                    "done\n",
                    "echo 'fake proot: no command' >&2\n",
                    "exit 127\n",
                ),
            )
            .unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        })
        .clone()
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, data).unwrap();
    path
}

/// Manifest document listing `(name, file, version, size)` entries
pub fn manifest_json(layers: &[(&str, &str, &str, u64)]) -> String {
    let entries: Vec<serde_json::Value> = layers
        .iter()
        .map(|(name, file, version, size)| {
            serde_json::json!({ "name": name, "file": file, "version": version, "size": size })
        })
        .collect();
    serde_json::json!({ "layers": entries }).to_string()
}
