//! TLS ClientHello parsing
//!
//! Walks the RFC 8446 ClientHello layout and surfaces the SNI and ALPN
//! list. The accept path normally relies on the TLS library's SNI
//! callback instead; this parser backs the `peek_sni` helper, which
//! inspects bytes the kernel still holds so nothing is consumed from the
//! stream.

use crate::error::ExtenderError;

/// Extension type: server_name
const EXT_SERVER_NAME: u16 = 0;
/// Extension type: supported_groups
const EXT_SUPPORTED_GROUPS: u16 = 10;
/// Extension type: ec_point_formats
const EXT_EC_POINT_FORMATS: u16 = 11;
/// Extension type: application_layer_protocol_negotiation
const EXT_ALPN: u16 = 16;
/// Extension type: signed_certificate_timestamp
const EXT_SCT: u16 = 18;

/// Extension types that carry no data
const EMPTY_EXTENSIONS: [u16; 3] = [
    22, // encrypt_then_mac
    23, // extended_master_secret
    49, // post_handshake_auth
];

/// A parsed extension from the ClientHello
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloExtension {
    /// server_name: the single host_name entry
    ServerName(String),
    /// ALPN protocol names in client preference order
    Alpn(Vec<String>),
    /// signed_certificate_timestamp request
    SignedCertTimestamp,
    /// supported_groups as raw group identifiers
    SupportedGroups(Vec<u16>),
    /// ec_point_formats as raw format identifiers
    EcPointFormats(Vec<u8>),
    /// A recognized empty-data extension
    Empty(u16),
    /// Any other extension, preserved opaquely
    Opaque {
        /// Extension type identifier
        ext_type: u16,
        /// Raw extension data
        data: Vec<u8>,
    },
}

/// A parsed ClientHello
#[derive(Debug, Clone)]
pub struct ClientHelloInfo {
    /// Legacy protocol version from the hello body
    pub legacy_version: u16,
    /// The 32-byte client random
    pub random: [u8; 32],
    /// Legacy session id
    pub session_id: Vec<u8>,
    /// Offered cipher suites
    pub cipher_suites: Vec<u16>,
    /// Legacy compression methods
    pub compression_methods: Vec<u8>,
    /// Extensions in wire order
    pub extensions: Vec<HelloExtension>,
}

impl ClientHelloInfo {
    /// The SNI host name, if the client sent one
    pub fn sni(&self) -> Option<&str> {
        self.extensions.iter().find_map(|ext| match ext {
            HelloExtension::ServerName(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// The ALPN protocol list, empty when absent
    pub fn alpn(&self) -> &[String] {
        self.extensions
            .iter()
            .find_map(|ext| match ext {
                HelloExtension::Alpn(protos) => Some(protos.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }
}

/// Cursor over the handshake bytes
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ExtenderError> {
        if self.remaining() < n {
            return Err(malformed("truncated ClientHello"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ExtenderError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ExtenderError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, ExtenderError> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    /// A length-prefixed vector where the prefix is one byte
    fn vec8(&mut self) -> Result<&'a [u8], ExtenderError> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    /// A length-prefixed vector where the prefix is two bytes
    fn vec16(&mut self) -> Result<&'a [u8], ExtenderError> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}

fn malformed(detail: &str) -> ExtenderError {
    ExtenderError::Handshake(format!("not a parseable ClientHello: {}", detail))
}

/// Parse a raw handshake message as a ClientHello
///
/// `buf` is the handshake message itself (starting at the one-byte
/// message type), without the outer TLS record header. The message must
/// be fully consumed; trailing bytes are an error.
pub fn parse_client_hello(buf: &[u8]) -> Result<ClientHelloInfo, ExtenderError> {
    let mut r = Reader::new(buf);

    if r.u8()? != 1 {
        return Err(malformed("handshake type is not client_hello"));
    }
    let body_len = r.u24()?;
    if body_len != r.remaining() {
        return Err(malformed("handshake length does not match body"));
    }

    let legacy_version = r.u16()?;

    let mut random = [0u8; 32];
    random.copy_from_slice(r.take(32)?);

    let session_id = r.vec8()?.to_vec();

    let suites_raw = r.vec16()?;
    if suites_raw.len() % 2 != 0 {
        return Err(malformed("odd cipher suite length"));
    }
    let cipher_suites = suites_raw
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();

    let compression_methods = r.vec8()?.to_vec();

    let mut extensions = Vec::new();
    if r.remaining() > 0 {
        let ext_block = r.vec16()?;
        let mut er = Reader::new(ext_block);
        while er.remaining() > 0 {
            let ext_type = er.u16()?;
            let data = er.vec16()?;
            extensions.push(parse_extension(ext_type, data)?);
        }
    }

    if r.remaining() != 0 {
        return Err(malformed("trailing bytes after extensions"));
    }

    Ok(ClientHelloInfo {
        legacy_version,
        random,
        session_id,
        cipher_suites,
        compression_methods,
        extensions,
    })
}

fn parse_extension(ext_type: u16, data: &[u8]) -> Result<HelloExtension, ExtenderError> {
    match ext_type {
        EXT_SERVER_NAME => {
            let mut r = Reader::new(data);
            let list = r.vec16()?;
            let mut lr = Reader::new(list);
            let name_type = lr.u8()?;
            if name_type != 0 {
                return Err(malformed("unknown server_name type"));
            }
            let name = lr.vec16()?;
            let name = std::str::from_utf8(name)
                .map_err(|_| malformed("server_name is not UTF-8"))?
                .to_string();
            Ok(HelloExtension::ServerName(name))
        }
        EXT_ALPN => {
            let mut r = Reader::new(data);
            let list = r.vec16()?;
            let mut lr = Reader::new(list);
            let mut protos = Vec::new();
            while lr.remaining() > 0 {
                let proto = lr.vec8()?;
                protos.push(
                    std::str::from_utf8(proto)
                        .map_err(|_| malformed("ALPN protocol is not UTF-8"))?
                        .to_string(),
                );
            }
            Ok(HelloExtension::Alpn(protos))
        }
        EXT_SCT => Ok(HelloExtension::SignedCertTimestamp),
        EXT_SUPPORTED_GROUPS => {
            let mut r = Reader::new(data);
            let list = r.vec16()?;
            if list.len() % 2 != 0 {
                return Err(malformed("odd supported_groups length"));
            }
            Ok(HelloExtension::SupportedGroups(
                list.chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect(),
            ))
        }
        EXT_EC_POINT_FORMATS => {
            let mut r = Reader::new(data);
            Ok(HelloExtension::EcPointFormats(r.vec8()?.to_vec()))
        }
        t if EMPTY_EXTENSIONS.contains(&t) && data.is_empty() => Ok(HelloExtension::Empty(t)),
        _ => Ok(HelloExtension::Opaque {
            ext_type,
            data: data.to_vec(),
        }),
    }
}

/// Extract the SNI from a raw TLS record containing a ClientHello
///
/// Convenience for peeked bytes: strips the 5-byte record header and
/// parses the handshake message inside.
pub fn sni_from_record(record: &[u8]) -> Result<Option<String>, ExtenderError> {
    if record.len() < 5 || record[0] != 0x16 {
        return Err(malformed("not a TLS handshake record"));
    }
    let record_len = u16::from_be_bytes([record[3], record[4]]) as usize;
    if record.len() < 5 + record_len {
        return Err(malformed("truncated TLS record"));
    }
    let hello = parse_client_hello(&record[5..5 + record_len])?;
    Ok(hello.sni().map(str::to_string))
}
