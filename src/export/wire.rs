// export/wire.rs
//
// NBD protocol constants shared by the export server and the transport
// client. Fixed-newstyle negotiation, simple replies only.

/// "NBDMAGIC", the first eight bytes of the server greeting.
pub const NBDMAGIC: u64 = 0x4e42444d41474943;

/// "IHAVEOPT", the second eight bytes of the greeting and the option magic.
pub const IHAVEOPT: u64 = 0x49484156454f5054;

/// Option reply magic.
pub const OPTION_REPLY_MAGIC: u64 = 0x0003e889045565a9;

/// Transmission request magic.
pub const REQUEST_MAGIC: u32 = 0x25609513;

/// Simple reply magic.
pub const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

// Handshake flags (server → client, u16).
pub const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const FLAG_NO_ZEROES: u16 = 1 << 1;

// Client flags (client → server, u32). Same bit meanings.
pub const CLIENT_FLAG_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const CLIENT_FLAG_NO_ZEROES: u32 = 1 << 1;

// Options.
pub const OPT_EXPORT_NAME: u32 = 1;
pub const OPT_ABORT: u32 = 2;
pub const OPT_LIST: u32 = 3;
pub const OPT_INFO: u32 = 6;
pub const OPT_GO: u32 = 7;

// Option reply types.
pub const REP_ACK: u32 = 1;
pub const REP_SERVER: u32 = 2;
pub const REP_INFO: u32 = 3;
pub const REP_FLAG_ERROR: u32 = 1 << 31;
pub const REP_ERR_UNSUP: u32 = REP_FLAG_ERROR | 1;
pub const REP_ERR_UNKNOWN: u32 = REP_FLAG_ERROR | 6;

// NBD_INFO types carried in GO/INFO replies.
pub const INFO_EXPORT: u16 = 0;

// Transmission command types.
pub const CMD_READ: u16 = 0;
pub const CMD_WRITE: u16 = 1;
pub const CMD_DISC: u16 = 2;
pub const CMD_FLUSH: u16 = 3;
pub const CMD_TRIM: u16 = 4;
pub const CMD_WRITE_ZEROES: u16 = 6;

// Transmission flags advertised with an export (u16).
pub const TRANSMISSION_HAS_FLAGS: u16 = 1 << 0;
pub const TRANSMISSION_READ_ONLY: u16 = 1 << 1;
pub const TRANSMISSION_SEND_FLUSH: u16 = 1 << 2;
pub const TRANSMISSION_SEND_TRIM: u16 = 1 << 5;
pub const TRANSMISSION_SEND_WRITE_ZEROES: u16 = 1 << 6;

// Errno values carried in simple replies.
pub const EOK: u32 = 0;
pub const EPERM: u32 = 1;
pub const EIO: u32 = 5;
pub const EINVAL: u32 = 22;
pub const ENOSPC: u32 = 28;
pub const EOPNOTSUPP: u32 = 95;

/// Hard cap on a single transmission payload. Matches the conventional
/// 32 MiB limit so neither side buffers unbounded requests.
pub const MAX_PAYLOAD: u32 = 32 * 1024 * 1024;

/// One parsed transmission request header.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub flags: u16,
    pub command: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl Request {
    pub const WIRE_LEN: usize = 28;

    pub fn decode(raw: &[u8; Self::WIRE_LEN]) -> Option<Request> {
        let magic = u32::from_be_bytes(raw[0..4].try_into().unwrap());
        if magic != REQUEST_MAGIC {
            return None;
        }
        Some(Request {
            flags: u16::from_be_bytes(raw[4..6].try_into().unwrap()),
            command: u16::from_be_bytes(raw[6..8].try_into().unwrap()),
            handle: u64::from_be_bytes(raw[8..16].try_into().unwrap()),
            offset: u64::from_be_bytes(raw[16..24].try_into().unwrap()),
            length: u32::from_be_bytes(raw[24..28].try_into().unwrap()),
        })
    }

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut raw = [0u8; Self::WIRE_LEN];
        raw[0..4].copy_from_slice(&REQUEST_MAGIC.to_be_bytes());
        raw[4..6].copy_from_slice(&self.flags.to_be_bytes());
        raw[6..8].copy_from_slice(&self.command.to_be_bytes());
        raw[8..16].copy_from_slice(&self.handle.to_be_bytes());
        raw[16..24].copy_from_slice(&self.offset.to_be_bytes());
        raw[24..28].copy_from_slice(&self.length.to_be_bytes());
        raw
    }
}

/// One simple reply header.
#[derive(Debug, Clone, Copy)]
pub struct SimpleReply {
    pub error: u32,
    pub handle: u64,
}

impl SimpleReply {
    pub const WIRE_LEN: usize = 16;

    pub fn decode(raw: &[u8; Self::WIRE_LEN]) -> Option<SimpleReply> {
        let magic = u32::from_be_bytes(raw[0..4].try_into().unwrap());
        if magic != SIMPLE_REPLY_MAGIC {
            return None;
        }
        Some(SimpleReply {
            error: u32::from_be_bytes(raw[4..8].try_into().unwrap()),
            handle: u64::from_be_bytes(raw[8..16].try_into().unwrap()),
        })
    }

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut raw = [0u8; Self::WIRE_LEN];
        raw[0..4].copy_from_slice(&SIMPLE_REPLY_MAGIC.to_be_bytes());
        raw[4..8].copy_from_slice(&self.error.to_be_bytes());
        raw[8..16].copy_from_slice(&self.handle.to_be_bytes());
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let request = Request {
            flags: 0,
            command: CMD_WRITE,
            handle: 0xDEADBEEF,
            offset: 1 << 30,
            length: 64 * 1024,
        };
        let raw = request.encode();
        let decoded = Request::decode(&raw).unwrap();
        assert_eq!(decoded.command, CMD_WRITE);
        assert_eq!(decoded.handle, 0xDEADBEEF);
        assert_eq!(decoded.offset, 1 << 30);
        assert_eq!(decoded.length, 64 * 1024);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut raw = Request {
            flags: 0,
            command: CMD_READ,
            handle: 1,
            offset: 0,
            length: 512,
        }
        .encode();
        raw[0] ^= 0xFF;
        assert!(Request::decode(&raw).is_none());
    }

    #[test]
    fn simple_reply_round_trips() {
        let reply = SimpleReply {
            error: EIO,
            handle: 42,
        };
        let decoded = SimpleReply::decode(&reply.encode()).unwrap();
        assert_eq!(decoded.error, EIO);
        assert_eq!(decoded.handle, 42);
    }
}
