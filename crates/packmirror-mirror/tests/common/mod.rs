// PackMirror - Mirror Git Repositories to Object Storage
// Copyright (C) 2025 PackMirror Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.

//! Shared helpers for mirror integration tests: synthetic pack replies,
//! refs advertisements, and a minimal one-shot HTTP server the mirror
//! talks to over loopback.

#![allow(dead_code)]

use packmirror_pack::{ObjectHasher, ObjectId, ObjectKind};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).expect("in-memory write");
    encoder.finish().expect("in-memory finish")
}

pub fn inflate(data: &[u8]) -> Vec<u8> {
    use std::io::Read;
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).expect("valid zlib");
    out
}

/// The id a canonical upload of this object must land under.
pub fn object_id(kind: ObjectKind, payload: &[u8]) -> ObjectId {
    let mut hasher = ObjectHasher::new(kind, payload.len() as u64);
    hasher.update(payload);
    hasher.finish()
}

pub fn encode_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let b = (value & 0x7f) as u8;
        value >>= 7;
        if value > 0 {
            out.push(b | 0x80);
        } else {
            out.push(b);
            return out;
        }
    }
}

pub fn encode_copy(offset: u64, size: u64) -> Vec<u8> {
    let mut instr = 0x80u8;
    let mut operands = Vec::new();
    for i in 0..4 {
        let byte = ((offset >> (8 * i)) & 0xff) as u8;
        if byte != 0 {
            instr |= 1 << i;
            operands.push(byte);
        }
    }
    let encoded = if size == 0x10000 { 0 } else { size };
    for i in 0..3 {
        let byte = ((encoded >> (8 * i)) & 0xff) as u8;
        if byte != 0 {
            instr |= 0x10 << i;
            operands.push(byte);
        }
    }
    let mut out = vec![instr];
    out.extend_from_slice(&operands);
    out
}

fn object_header(type_nibble: u8, mut size: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut b = (type_nibble << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size > 0 {
        out.push(b | 0x80);
        b = (size & 0x7f) as u8;
        size >>= 7;
    }
    out.push(b);
    out
}

fn pack_type(kind: ObjectKind) -> u8 {
    match kind {
        ObjectKind::Commit => 1,
        ObjectKind::Tree => 2,
        ObjectKind::Blob => 3,
        ObjectKind::Tag => 4,
    }
}

/// A full (non-delta) pack entry.
pub fn full_entry(kind: ObjectKind, payload: &[u8]) -> Vec<u8> {
    let mut entry = object_header(pack_type(kind), payload.len() as u64);
    entry.extend_from_slice(&zlib(payload));
    entry
}

/// A ref-delta entry against `base`.
pub fn delta_entry(base: &ObjectId, delta: &[u8]) -> Vec<u8> {
    let mut entry = object_header(7, delta.len() as u64);
    entry.extend_from_slice(base.as_bytes());
    entry.extend_from_slice(&zlib(delta));
    entry
}

/// An entry with a raw type nibble, for exercising rejected encodings.
pub fn raw_entry(type_nibble: u8, payload: &[u8]) -> Vec<u8> {
    let mut entry = object_header(type_nibble, payload.len() as u64);
    entry.extend_from_slice(&zlib(payload));
    entry
}

/// A complete `git-upload-pack` reply: NAK, header, entries, zeroed trailer.
pub fn pack_reply(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut reply = b"0008NAK\n".to_vec();
    reply.extend_from_slice(b"PACK");
    reply.extend_from_slice(&2u32.to_be_bytes());
    reply.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in entries {
        reply.extend_from_slice(entry);
    }
    reply.extend_from_slice(&[0u8; 20]);
    reply
}

fn pkt(payload: &str) -> String {
    format!("{:04x}{}", payload.len() + 4, payload)
}

/// A refs advertisement with the given symbolic HEAD and `(sha, name)` refs.
pub fn advertisement(head_symref: &str, refs: &[(String, String)]) -> Vec<u8> {
    let mut body = String::new();
    body.push_str(&pkt("# service=git-upload-pack\n"));
    body.push_str("0000");
    let head_sha = refs
        .first()
        .map(|(sha, _)| sha.clone())
        .unwrap_or_else(|| "0".repeat(40));
    body.push_str(&pkt(&format!(
        "{head_sha} HEAD\0multi_ack symref=HEAD:{head_symref} agent=git/2.43.0\n"
    )));
    for (sha, name) in refs {
        body.push_str(&pkt(&format!("{sha} {name}\n")));
    }
    body.push_str("0000");
    body.into_bytes()
}

/// Minimal loopback HTTP server. Routes are keyed `"METHOD /path?query"`;
/// every response is 200 with the mapped body, everything else is 404.
pub struct StubServer {
    pub base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl StubServer {
    pub async fn start(routes: HashMap<String, Vec<u8>>) -> StubServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let routes = Arc::new(routes);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let routes = Arc::clone(&routes);
                tokio::spawn(async move {
                    let Some((method, path)) = read_request(&mut socket).await else {
                        return;
                    };
                    let key = format!("{method} {path}");
                    let response = match routes.get(&key) {
                        Some(body) => {
                            let mut response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                                body.len()
                            )
                            .into_bytes();
                            response.extend_from_slice(body);
                            response
                        }
                        None => {
                            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                                .to_vec()
                        }
                    };
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        StubServer {
            base_url: format!("http://{addr}"),
            handle,
        }
    }

    /// Convenience for the three git endpoints of one repository.
    pub async fn for_repo(
        repo: &str,
        advert: Vec<u8>,
        pack: Option<Vec<u8>>,
    ) -> StubServer {
        let mut routes = HashMap::new();
        routes.insert(
            format!("GET /{repo}/info/refs?service=git-upload-pack"),
            advert,
        );
        if let Some(pack) = pack {
            routes.insert(format!("POST /{repo}/git-upload-pack"), pack);
        }
        StubServer::start(routes).await
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Read one request: returns (method, path-with-query), consuming any body.
async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<(String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 1 << 20 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let content_length: usize = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0);

    // Drain the body so the client never sees a reset mid-request.
    let mut body_read = buf.len() - (header_end + 4);
    while body_read < content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body_read += n;
    }

    Some((method, path))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
