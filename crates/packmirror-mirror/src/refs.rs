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

//! Refs advertisement parsing and the files written for dumb-HTTP clients
//!
//! `GET <base>/info/refs?service=git-upload-pack` answers in pkt-line
//! framing: a service announcement, a flush, one ref line carrying the
//! capability list after a NUL (including `symref=HEAD:<ref>`), then one
//! line per ref until the terminating flush. The capability-bearing line
//! itself is not part of the collected ref list, matching what the mirror
//! later writes to `info/refs`.

use crate::error::MirrorError;

/// One advertised `(sha, ref-name)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedRef {
    /// 40-character hex object id
    pub sha: String,
    /// Fully qualified ref name, e.g. `refs/heads/main`
    pub name: String,
}

/// The parsed refs advertisement
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    /// The symbolic HEAD target from the `symref=HEAD:<ref>` capability
    pub head_symref: Option<String>,
    /// Advertised refs, in server order, excluding the capability line
    pub refs: Vec<AdvertisedRef>,
}

/// Parse the body of an `info/refs?service=git-upload-pack` response.
pub fn parse_advertisement(body: &[u8]) -> Result<Advertisement, MirrorError> {
    let mut cursor = body;

    let service = next_frame(&mut cursor)?
        .ok_or_else(|| MirrorError::remote("advertisement starts with a flush packet"))?;
    if !service.starts_with(b"# service=git-upload-pack") {
        return Err(MirrorError::remote(format!(
            "unexpected service announcement: {:?}",
            String::from_utf8_lossy(service)
        )));
    }
    if next_frame(&mut cursor)?.is_some() {
        return Err(MirrorError::remote(
            "expected flush after the service announcement",
        ));
    }

    // First ref line: "<sha> <name>\0<capabilities>".
    let Some(first) = next_frame(&mut cursor)? else {
        return Ok(Advertisement::default());
    };
    let first = trim_newline(first);
    let head_symref = first
        .splitn(2, |b| *b == 0)
        .nth(1)
        .map(String::from_utf8_lossy)
        .and_then(|caps| {
            caps.split(' ')
                .find_map(|c| c.strip_prefix("symref=HEAD:").map(str::to_string))
        });

    let mut refs = Vec::new();
    while let Some(frame) = next_frame(&mut cursor)? {
        refs.push(parse_ref_line(trim_newline(frame))?);
    }

    Ok(Advertisement { head_symref, refs })
}

/// Build the `git-upload-pack` request body wanting every advertised sha:
/// one `0032want <sha>\n` line per ref, then a flush, then `0009done\n`.
pub fn build_want_request(refs: &[AdvertisedRef]) -> Vec<u8> {
    let mut body = Vec::with_capacity(refs.len() * 0x32 + 13);
    for advertised in refs {
        body.extend_from_slice(format!("0032want {}\n", advertised.sha).as_bytes());
    }
    body.extend_from_slice(b"0000");
    body.extend_from_slice(b"0009done\n");
    body
}

/// Render the `info/refs` index: one `<sha>\t<name>\n` line per ref.
pub fn render_info_refs(refs: &[AdvertisedRef]) -> String {
    let mut out = String::new();
    for advertised in refs {
        out.push_str(&advertised.sha);
        out.push('\t');
        out.push_str(&advertised.name);
        out.push('\n');
    }
    out
}

/// Render the `HEAD` file contents for a symbolic head.
pub fn render_head(symref: &str) -> String {
    format!("ref: {symref}\n")
}

/// Read one pkt-line frame; `None` is a flush packet.
fn next_frame<'a>(cursor: &mut &'a [u8]) -> Result<Option<&'a [u8]>, MirrorError> {
    if cursor.len() < 4 {
        return Err(MirrorError::remote("truncated refs advertisement"));
    }
    let digits = std::str::from_utf8(&cursor[..4])
        .map_err(|_| MirrorError::remote("pkt-line length is not ASCII"))?;
    let len = usize::from_str_radix(digits, 16)
        .map_err(|_| MirrorError::remote(format!("pkt-line length is not hex: {digits:?}")))?;

    if len == 0 {
        *cursor = &cursor[4..];
        return Ok(None);
    }
    if len < 4 || cursor.len() < len {
        return Err(MirrorError::remote(format!("bad pkt-line length {len}")));
    }
    let frame = &cursor[4..len];
    *cursor = &cursor[len..];
    Ok(Some(frame))
}

fn parse_ref_line(line: &[u8]) -> Result<AdvertisedRef, MirrorError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| MirrorError::remote("ref line is not UTF-8"))?;
    let Some((sha, name)) = text.split_once(' ') else {
        return Err(MirrorError::remote(format!("malformed ref line: {text:?}")));
    };
    if sha.len() != 40 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(MirrorError::remote(format!("malformed ref sha: {sha:?}")));
    }
    Ok(AdvertisedRef {
        sha: sha.to_string(),
        name: name.to_string(),
    })
}

fn trim_newline(frame: &[u8]) -> &[u8] {
    frame.strip_suffix(b"\n").unwrap_or(frame)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn pkt(payload: &str) -> String {
        format!("{:04x}{}", payload.len() + 4, payload)
    }

    fn sample_advertisement() -> Vec<u8> {
        let mut body = String::new();
        body.push_str(&pkt("# service=git-upload-pack\n"));
        body.push_str("0000");
        body.push_str(&pkt(&format!(
            "{SHA_A} HEAD\0multi_ack symref=HEAD:refs/heads/main agent=git/2.43.0\n"
        )));
        body.push_str(&pkt(&format!("{SHA_A} refs/heads/main\n")));
        body.push_str(&pkt(&format!("{SHA_B} refs/tags/v1.0\n")));
        body.push_str("0000");
        body.into_bytes()
    }

    #[test]
    fn parses_symref_and_refs() {
        let advert = parse_advertisement(&sample_advertisement()).unwrap();
        assert_eq!(advert.head_symref.as_deref(), Some("refs/heads/main"));
        assert_eq!(
            advert.refs,
            vec![
                AdvertisedRef { sha: SHA_A.into(), name: "refs/heads/main".into() },
                AdvertisedRef { sha: SHA_B.into(), name: "refs/tags/v1.0".into() },
            ]
        );
    }

    #[test]
    fn capability_line_without_symref() {
        let mut body = String::new();
        body.push_str(&pkt("# service=git-upload-pack\n"));
        body.push_str("0000");
        body.push_str(&pkt(&format!("{SHA_A} HEAD\0multi_ack thin-pack\n")));
        body.push_str("0000");

        let advert = parse_advertisement(body.as_bytes()).unwrap();
        assert_eq!(advert.head_symref, None);
        assert!(advert.refs.is_empty());
    }

    #[test]
    fn rejects_wrong_service() {
        let mut body = String::new();
        body.push_str(&pkt("# service=git-receive-pack\n"));
        body.push_str("0000");
        assert!(matches!(
            parse_advertisement(body.as_bytes()),
            Err(MirrorError::Remote(_))
        ));
    }

    #[test]
    fn rejects_truncated_body() {
        let body = pkt("# service=git-upload-pack\n");
        let truncated = &body.as_bytes()[..body.len() - 3];
        assert!(matches!(
            parse_advertisement(truncated),
            Err(MirrorError::Remote(_))
        ));
    }

    #[test]
    fn want_request_shape() {
        let refs = vec![
            AdvertisedRef { sha: SHA_A.into(), name: "refs/heads/main".into() },
            AdvertisedRef { sha: SHA_B.into(), name: "refs/tags/v1.0".into() },
        ];
        let body = build_want_request(&refs);
        let expected = format!("0032want {SHA_A}\n0032want {SHA_B}\n00000009done\n");
        assert_eq!(body, expected.as_bytes());
    }

    #[test]
    fn info_refs_rendering() {
        let refs = vec![AdvertisedRef { sha: SHA_A.into(), name: "refs/heads/main".into() }];
        assert_eq!(
            render_info_refs(&refs),
            format!("{SHA_A}\trefs/heads/main\n")
        );
        assert_eq!(render_head("refs/heads/main"), "ref: refs/heads/main\n");
    }
}
