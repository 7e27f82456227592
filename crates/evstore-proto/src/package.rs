//! Package framing.
//!
//! A package is the unit exchanged with the server. On the wire it is
//! prefixed by a little-endian `u32` holding the length of everything
//! after the prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::command::Command;
use crate::credentials::UserCredentials;
use crate::error::{ProtoError, ProtoResult};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// command + flags + correlation id.
pub const HEADER_SIZE: usize = 1 + 1 + 16;

/// Largest frame body accepted in either direction (64 MiB).
pub const MAX_PACKAGE_SIZE: usize = 64 * 1024 * 1024;

const FLAG_AUTHENTICATED: u8 = 0x01;
const FLAG_TRUSTED_WRITE: u8 = 0x02;

/// A decoded wire package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub command: Command,
    pub correlation_id: Uuid,
    /// Present exactly when the authenticated flag is set.
    pub credentials: Option<UserCredentials>,
    pub trusted_write: bool,
    pub payload: Bytes,
}

impl Package {
    pub fn new(command: Command, correlation_id: Uuid, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            correlation_id,
            credentials: None,
            trusted_write: false,
            payload: payload.into(),
        }
    }

    /// Build a package whose payload is an encoded protobuf message.
    pub fn from_message<M: prost::Message>(command: Command, correlation_id: Uuid, message: &M) -> Self {
        Self::new(command, correlation_id, message.encode_to_vec())
    }

    pub fn with_credentials(mut self, credentials: Option<UserCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    /// Parse the payload as protobuf message `M`.
    pub fn message<M: prost::Message + Default>(&self) -> ProtoResult<M> {
        Ok(M::decode(self.payload.as_ref())?)
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.credentials.is_some() {
            flags |= FLAG_AUTHENTICATED;
        }
        if self.trusted_write {
            flags |= FLAG_TRUSTED_WRITE;
        }
        flags
    }

    /// Size of the frame body (everything after the length prefix).
    pub fn body_len(&self) -> usize {
        let creds = self
            .credentials
            .as_ref()
            .map(|c| 2 + c.username.len() + c.password.len())
            .unwrap_or(0);
        HEADER_SIZE + creds + self.payload.len()
    }

    /// Check everything that would make [`encode_into`](Self::encode_into)
    /// fail, without encoding.
    pub fn validate(&self) -> ProtoResult<()> {
        if let Some(creds) = &self.credentials {
            creds.validate()?;
        }
        let body_len = self.body_len();
        if body_len > MAX_PACKAGE_SIZE {
            return Err(ProtoError::PackageTooLarge {
                size: body_len,
                max: MAX_PACKAGE_SIZE,
            });
        }
        Ok(())
    }

    /// Append the full frame, length prefix included, to `buf`.
    ///
    /// Nothing is written when the package is invalid.
    pub fn encode_into(&self, buf: &mut BytesMut) -> ProtoResult<()> {
        self.validate()?;
        let body_len = self.body_len();

        buf.reserve(LENGTH_PREFIX_SIZE + body_len);
        buf.put_u32_le(body_len as u32);
        buf.put_u8(self.command.code());
        buf.put_u8(self.flags());
        buf.put_slice(&self.correlation_id.to_bytes_le());

        if let Some(creds) = &self.credentials {
            put_short_string(buf, "login", &creds.username)?;
            put_short_string(buf, "password", &creds.password)?;
        }

        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn encode(&self) -> ProtoResult<Bytes> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode exactly one complete frame, length prefix included.
    ///
    /// The declared length must account for every byte after the prefix.
    pub fn decode(frame: &[u8]) -> ProtoResult<Self> {
        if frame.len() < LENGTH_PREFIX_SIZE {
            return Err(ProtoError::MalformedPackage(format!(
                "{} bytes is shorter than the length prefix",
                frame.len()
            )));
        }
        let declared = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let body = &frame[LENGTH_PREFIX_SIZE..];
        if declared > MAX_PACKAGE_SIZE {
            return Err(ProtoError::PackageTooLarge {
                size: declared,
                max: MAX_PACKAGE_SIZE,
            });
        }
        if declared != body.len() {
            return Err(ProtoError::MalformedPackage(format!(
                "declared length {declared} does not match body length {}",
                body.len()
            )));
        }
        Self::decode_body(Bytes::copy_from_slice(body))
    }

    /// Streaming decode for a socket read buffer.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered. On success the
    /// frame's bytes are removed from `buf`; trailing bytes are left for
    /// the next call.
    pub fn decode_frame(buf: &mut BytesMut) -> ProtoResult<Option<Self>> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let declared = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if declared > MAX_PACKAGE_SIZE {
            return Err(ProtoError::PackageTooLarge {
                size: declared,
                max: MAX_PACKAGE_SIZE,
            });
        }
        if buf.len() < LENGTH_PREFIX_SIZE + declared {
            buf.reserve(LENGTH_PREFIX_SIZE + declared - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let body = buf.split_to(declared).freeze();
        Self::decode_body(body).map(Some)
    }

    fn decode_body(mut body: Bytes) -> ProtoResult<Self> {
        if body.len() < HEADER_SIZE {
            return Err(ProtoError::MalformedPackage(format!(
                "body of {} bytes is shorter than the {HEADER_SIZE} byte header",
                body.len()
            )));
        }

        let command = Command::try_from(body.get_u8())?;
        let flags = body.get_u8();
        if flags & !(FLAG_AUTHENTICATED | FLAG_TRUSTED_WRITE) != 0 {
            return Err(ProtoError::MalformedPackage(format!(
                "unknown flag bits 0x{flags:02X}"
            )));
        }

        let mut id = [0u8; 16];
        body.copy_to_slice(&mut id);
        let correlation_id = Uuid::from_bytes_le(id);

        let credentials = if flags & FLAG_AUTHENTICATED != 0 {
            let username = take_short_string(&mut body, "login")?;
            let password = take_short_string(&mut body, "password")?;
            Some(UserCredentials { username, password })
        } else {
            None
        };

        Ok(Self {
            command,
            correlation_id,
            credentials,
            trusted_write: flags & FLAG_TRUSTED_WRITE != 0,
            payload: body,
        })
    }
}

fn put_short_string(buf: &mut BytesMut, field: &'static str, value: &str) -> ProtoResult<()> {
    let len = value.len();
    if len > u8::MAX as usize {
        return Err(ProtoError::CredentialsTooLong { field, len });
    }
    buf.put_u8(len as u8);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn take_short_string(body: &mut Bytes, field: &'static str) -> ProtoResult<String> {
    if !body.has_remaining() {
        return Err(ProtoError::MalformedPackage(format!("{field} length missing")));
    }
    let len = body.get_u8() as usize;
    if body.remaining() < len {
        return Err(ProtoError::MalformedPackage(format!(
            "{field} declares {len} bytes, {} remain",
            body.remaining()
        )));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| ProtoError::MalformedPackage(format!("{field} is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(creds: Option<UserCredentials>) -> Package {
        Package::new(Command::WriteEvents, Uuid::new_v4(), Bytes::from_static(b"\x0a\x03abc"))
            .with_credentials(creds)
    }

    #[test]
    fn roundtrip_without_credentials() {
        let pkg = sample(None);
        let encoded = pkg.encode().unwrap();
        assert_eq!(encoded.len(), LENGTH_PREFIX_SIZE + HEADER_SIZE + 5);
        assert_eq!(Package::decode(&encoded).unwrap(), pkg);
    }

    #[test]
    fn roundtrip_with_credentials_and_trusted_write() {
        let mut pkg = sample(Some(UserCredentials::new("admin", "changeit")));
        pkg.trusted_write = true;
        let encoded = pkg.encode().unwrap();
        assert_eq!(encoded[5], FLAG_AUTHENTICATED | FLAG_TRUSTED_WRITE);
        assert_eq!(Package::decode(&encoded).unwrap(), pkg);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let pkg = Package::new(Command::HeartbeatRequest, Uuid::new_v4(), Bytes::new());
        let encoded = pkg.encode().unwrap();
        assert_eq!(encoded.len(), LENGTH_PREFIX_SIZE + HEADER_SIZE);
        assert_eq!(Package::decode(&encoded).unwrap(), pkg);
    }

    #[test]
    fn correlation_id_uses_guid_byte_order() {
        let id = Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap();
        let pkg = Package::new(Command::Ping, id, Bytes::new());
        let encoded = pkg.encode().unwrap();
        assert_eq!(
            &encoded[6..22],
            &[
                0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
                0xee, 0xff
            ]
        );
    }

    #[test]
    fn length_mismatch_is_malformed() {
        let encoded = sample(None).encode().unwrap();
        let mut longer = encoded.to_vec();
        longer.push(0);
        assert!(matches!(
            Package::decode(&longer),
            Err(ProtoError::MalformedPackage(_))
        ));
        assert!(matches!(
            Package::decode(&encoded[..encoded.len() - 1]),
            Err(ProtoError::MalformedPackage(_))
        ));
    }

    #[test]
    fn truncated_header_is_malformed() {
        let mut frame = BytesMut::new();
        frame.put_u32_le(3);
        frame.put_slice(&[0x82, 0x00, 0x01]);
        assert!(matches!(
            Package::decode(&frame),
            Err(ProtoError::MalformedPackage(_))
        ));
    }

    #[test]
    fn truncated_credentials_are_malformed() {
        let mut frame = BytesMut::new();
        frame.put_u32_le((HEADER_SIZE + 3) as u32);
        frame.put_u8(Command::ReadEvent.code());
        frame.put_u8(FLAG_AUTHENTICATED);
        frame.put_slice(&[0u8; 16]);
        frame.put_u8(10);
        frame.put_slice(b"ab");
        assert!(matches!(
            Package::decode(&frame),
            Err(ProtoError::MalformedPackage(_))
        ));
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let mut encoded = sample(None).encode().unwrap().to_vec();
        encoded[5] = 0x80;
        assert!(matches!(
            Package::decode(&encoded),
            Err(ProtoError::MalformedPackage(_))
        ));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut encoded = sample(None).encode().unwrap().to_vec();
        encoded[4] = 0x7E;
        assert!(matches!(
            Package::decode(&encoded),
            Err(ProtoError::UnknownCommand(0x7E))
        ));
    }

    #[test]
    fn oversized_credentials_fail_to_encode() {
        let pkg = sample(Some(UserCredentials::new("u".repeat(256), "p")));
        assert!(matches!(
            pkg.encode(),
            Err(ProtoError::CredentialsTooLong { field: "login", len: 256 })
        ));
    }

    #[test]
    fn oversized_payload_fails_validation_without_writing() {
        let pkg = Package::new(Command::WriteEvents, Uuid::new_v4(), vec![0u8; MAX_PACKAGE_SIZE]);
        assert!(matches!(pkg.validate(), Err(ProtoError::PackageTooLarge { .. })));

        let mut buf = BytesMut::new();
        assert!(pkg.encode_into(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_credentials_leave_buffer_untouched() {
        let pkg = sample(Some(UserCredentials::new("ops", "p".repeat(256))));
        let mut buf = BytesMut::new();
        assert!(matches!(
            pkg.encode_into(&mut buf),
            Err(ProtoError::CredentialsTooLong { field: "password", .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_declared_length_fails_fast() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_PACKAGE_SIZE + 1) as u32);
        assert!(matches!(
            Package::decode_frame(&mut buf),
            Err(ProtoError::PackageTooLarge { .. })
        ));
    }

    #[test]
    fn streaming_decode_waits_for_complete_frame() {
        let pkg = sample(Some(UserCredentials::new("ops", "secret")));
        let encoded = pkg.encode().unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..3]);
        assert!(Package::decode_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[3..10]);
        assert!(Package::decode_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[10..]);
        assert_eq!(Package::decode_frame(&mut buf).unwrap(), Some(pkg));
        assert!(buf.is_empty());
    }

    #[test]
    fn streaming_decode_splits_back_to_back_frames() {
        let first = sample(None);
        let second = Package::new(Command::HeartbeatResponse, Uuid::new_v4(), Bytes::new());

        let mut buf = BytesMut::new();
        first.encode_into(&mut buf).unwrap();
        second.encode_into(&mut buf).unwrap();

        assert_eq!(Package::decode_frame(&mut buf).unwrap(), Some(first));
        assert_eq!(Package::decode_frame(&mut buf).unwrap(), Some(second));
        assert!(Package::decode_frame(&mut buf).unwrap().is_none());
    }
}
