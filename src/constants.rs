//! Wire protocol constants.

/// Packet header: 3-byte little-endian payload length + 1-byte sequence id.
pub const HEADER_LEN: usize = 4;

/// Largest payload a single packet can carry. A packet with exactly this
/// payload length is followed by a continuation packet.
pub const MAX_PAYLOAD_LEN: usize = 0xff_ffff;

pub const SCRAMBLE_LEN: usize = 20;
pub const SHA1_LEN: usize = 20;

pub const PROTOCOL_VERSION: u8 = 10;

// First payload byte of server responses.
pub const OK_HEADER: u8 = 0x00;
pub const ERR_HEADER: u8 = 0xff;
pub const EOF_HEADER: u8 = 0xfe;
pub const LOCAL_INFILE_HEADER: u8 = 0xfb;
pub const AUTH_SWITCH_HEADER: u8 = 0xfe;

// Command bytes.
pub const COM_QUIT: u8 = 0x01;
pub const COM_INIT_DB: u8 = 0x02;
pub const COM_QUERY: u8 = 0x03;
pub const COM_FIELD_LIST: u8 = 0x04;
pub const COM_STATISTICS: u8 = 0x09;
pub const COM_PING: u8 = 0x0e;
pub const COM_CHANGE_USER: u8 = 0x11;
pub const COM_STMT_PREPARE: u8 = 0x16;
pub const COM_STMT_EXECUTE: u8 = 0x17;
pub const COM_STMT_SEND_LONG_DATA: u8 = 0x18;
pub const COM_STMT_CLOSE: u8 = 0x19;
pub const COM_STMT_FETCH: u8 = 0x1c;

// Capability flags.
pub const CLIENT_LONG_PASSWORD: u32 = 1;
pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
pub const CLIENT_SSL: u32 = 1 << 11;
pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

/// Capabilities the proxy offers on both sides of a session.
pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_FOUND_ROWS
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_CONNECT_ATTRS;

// Server status flags carried in OK and EOF packets.
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
pub const SERVER_MORE_RESULTS_EXIST: u16 = 0x0008;

/// COM_STMT_EXECUTE flag that opens a read-only cursor.
pub const CURSOR_TYPE_READ_ONLY: u8 = 0x01;

pub const DEFAULT_CHARSET: u8 = 0x21;
pub const DEFAULT_AUTH_PLUGIN: &str = "mysql_native_password";

pub const ER_HOST_IS_BLOCKED: u16 = 1129;
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
pub const ER_CONNECTION_KILLED: u16 = 1927;

const _: () = assert!(HEADER_LEN == 4, "header is 3 length bytes + sequence");
