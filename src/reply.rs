//! Tracks how far the reply to the current command has arrived.

use crate::constants::*;
use crate::protocol::{self, ErrPacket, ParseResult, PayloadReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// Waiting for the first packet of a reply.
    Start,
    /// The reply is complete.
    Done,
    /// Reading column definitions.
    RsetColdef,
    /// Waiting for the EOF after the column definitions.
    RsetColdefEof,
    /// Reading rows until EOF or ERR.
    RsetRows,
    /// Reading the parameter and column definitions of a prepared statement.
    Prepare,
}

/// Summary of the reply to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub command: u8,
    pub state: ReplyState,
    pub field_count: u64,
    pub rows: u64,
    pub is_ok: bool,
    pub error: Option<ErrPacket>,
    pub server_status: u16,
    /// Payload bytes seen so far.
    pub size: usize,
}

impl Reply {
    fn new(command: u8, state: ReplyState) -> Self {
        Self {
            command,
            state,
            field_count: 0,
            rows: 0,
            is_ok: false,
            error: None,
            server_status: 0,
            size: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ReplyState::Done
    }
}

/// Commands that never get a response from the server.
pub fn will_respond(command: u8) -> bool {
    !matches!(
        command,
        COM_QUIT | COM_STMT_SEND_LONG_DATA | COM_STMT_CLOSE
    )
}

#[derive(Debug)]
pub struct ReplyTracker {
    reply: Reply,
    num_coldefs: u64,
    ps_packets: u64,
    /// The previous packet had the maximum payload, the next one is its tail.
    skip_next: bool,
    opening_cursor: bool,
}

impl Default for ReplyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self {
            reply: Reply::new(0, ReplyState::Done),
            num_coldefs: 0,
            ps_packets: 0,
            skip_next: false,
            opening_cursor: false,
        }
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn state(&self) -> ReplyState {
        self.reply.state
    }

    pub fn is_complete(&self) -> bool {
        self.reply.is_complete()
    }

    /// Start tracking the reply to the command in `packet` (header included).
    pub fn track_query(&mut self, packet: &[u8]) {
        let command = protocol::command(packet).unwrap_or(0);
        let state = match command {
            c if !will_respond(c) => ReplyState::Done,
            COM_FIELD_LIST | COM_STMT_FETCH => ReplyState::RsetRows,
            _ => ReplyState::Start,
        };
        self.reply = Reply::new(command, state);
        self.num_coldefs = 0;
        self.ps_packets = 0;
        self.skip_next = false;
        self.opening_cursor = command == COM_STMT_EXECUTE
            && packet
                .get(HEADER_LEN + 5)
                .is_some_and(|flags| flags & CURSOR_TYPE_READ_ONLY != 0);
    }

    /// Feed a buffer made of complete packets.
    pub fn process(&mut self, buf: &[u8]) {
        let mut offset = 0;
        while let ParseResult::Complete {
            payload_len,
            bytes_consumed,
        } = protocol::try_parse_packet(&buf[offset..])
        {
            let payload = &buf[offset + HEADER_LEN..offset + bytes_consumed];
            self.reply.size += payload_len;
            if self.skip_next {
                // Tail of a large row, nothing to inspect.
            } else {
                self.process_one(payload);
            }
            self.skip_next = payload_len == MAX_PAYLOAD_LEN;
            offset += bytes_consumed;
        }
    }

    fn process_one(&mut self, payload: &[u8]) {
        match self.reply.state {
            ReplyState::Start => self.process_reply_start(payload),
            ReplyState::Done => {
                if let Some(err) = ErrPacket::parse(payload) {
                    // Unsolicited, e.g. the server killed the connection.
                    self.reply.error = Some(err);
                } else {
                    tracing::debug!(
                        command = self.reply.command,
                        "ignoring packet after completed reply"
                    );
                }
            }
            ReplyState::RsetColdef => {
                self.num_coldefs = self.num_coldefs.saturating_sub(1);
                if self.num_coldefs == 0 {
                    self.reply.state = ReplyState::RsetColdefEof;
                }
            }
            ReplyState::RsetColdefEof => {
                if self.opening_cursor {
                    self.opening_cursor = false;
                    self.reply.state = ReplyState::Done;
                } else {
                    self.reply.state = ReplyState::RsetRows;
                }
            }
            ReplyState::RsetRows => {
                if protocol::is_eof(payload) {
                    let status = protocol::eof_status(payload).unwrap_or(0);
                    self.finish_result(status);
                } else if let Some(err) = ErrPacket::parse(payload) {
                    self.reply.error = Some(err);
                    self.reply.state = ReplyState::Done;
                } else {
                    self.reply.rows += 1;
                }
            }
            ReplyState::Prepare => {
                self.ps_packets = self.ps_packets.saturating_sub(1);
                if self.ps_packets == 0 {
                    self.reply.state = ReplyState::Done;
                }
            }
        }
    }

    fn process_reply_start(&mut self, payload: &[u8]) {
        if self.reply.command == COM_STATISTICS {
            // A single human readable string.
            self.reply.state = ReplyState::Done;
            return;
        }
        match payload.first() {
            Some(&OK_HEADER) if self.reply.command == COM_STMT_PREPARE => {
                self.process_prepare_ok(payload)
            }
            Some(&OK_HEADER) => {
                self.reply.is_ok = true;
                let status = protocol::ok_status(payload).unwrap_or(0);
                self.finish_result(status);
            }
            Some(&ERR_HEADER) => {
                self.reply.error = ErrPacket::parse(payload);
                self.reply.state = ReplyState::Done;
            }
            Some(&LOCAL_INFILE_HEADER) => {
                // The client streams the file; its final reply is tracked by
                // the next command.
                self.reply.state = ReplyState::Done;
            }
            _ if protocol::is_eof(payload) => {
                let status = protocol::eof_status(payload).unwrap_or(0);
                self.finish_result(status);
            }
            _ => {
                let field_count = PayloadReader::new(payload).lenenc_int().unwrap_or(0);
                self.reply.field_count = field_count;
                self.num_coldefs = field_count;
                self.reply.state = if field_count == 0 {
                    ReplyState::Done
                } else {
                    ReplyState::RsetColdef
                };
            }
        }
    }

    fn process_prepare_ok(&mut self, payload: &[u8]) {
        let mut r = PayloadReader::new(payload);
        let counts = r
            .skip(1 + 4)
            .and_then(|_| Some((r.u16()?, r.u16()?)));
        let Some((columns, params)) = counts else {
            self.reply.state = ReplyState::Done;
            return;
        };
        self.reply.is_ok = true;
        self.reply.field_count = u64::from(columns);
        let defs = |n: u16| if n > 0 { u64::from(n) + 1 } else { 0 };
        self.ps_packets = defs(columns) + defs(params);
        self.reply.state = if self.ps_packets == 0 {
            ReplyState::Done
        } else {
            ReplyState::Prepare
        };
    }

    fn finish_result(&mut self, status: u16) {
        self.reply.server_status = status;
        self.reply.state = if status & SERVER_MORE_RESULTS_EXIST != 0 {
            ReplyState::Start
        } else {
            ReplyState::Done
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{com_query, eof_packet, err_packet, ok_packet, packet};

    fn result_set(columns: u8, rows: usize, status: u16) -> Vec<u8> {
        let mut buf = packet(1, &[columns]);
        for i in 0..columns {
            buf.extend(packet(2 + i, b"\x03def\x00\x00\x00\x01c\x00\x0c"));
        }
        buf.extend(eof_packet(2 + columns, 0));
        for _ in 0..rows {
            buf.extend(packet(0, b"\x011"));
        }
        buf.extend(eof_packet(0, status));
        buf
    }

    #[test]
    fn ok_completes_reply() {
        let mut t = ReplyTracker::new();
        t.track_query(&com_query("set autocommit=1"));
        assert_eq!(t.state(), ReplyState::Start);
        t.process(&ok_packet(1, SERVER_STATUS_AUTOCOMMIT));
        assert!(t.is_complete());
        assert!(t.reply().is_ok);
    }

    #[test]
    fn result_set_counts_rows() {
        let mut t = ReplyTracker::new();
        t.track_query(&com_query("select a, b from t"));
        let rs = result_set(2, 3, 0);
        // Split after the column count and the first column definition.
        let first = protocol::logical_packet_len(&rs).unwrap();
        let split = first + protocol::logical_packet_len(&rs[first..]).unwrap();
        t.process(&rs[..split]);
        assert_eq!(t.state(), ReplyState::RsetColdef);
        t.process(&rs[split..]);
        assert!(t.is_complete());
        assert_eq!(t.reply().field_count, 2);
        assert_eq!(t.reply().rows, 3);
    }

    #[test]
    fn more_results_loop_back_to_start() {
        let mut t = ReplyTracker::new();
        t.track_query(&com_query("call p()"));
        t.process(&result_set(1, 1, SERVER_MORE_RESULTS_EXIST));
        assert_eq!(t.state(), ReplyState::Start);
        t.process(&ok_packet(5, 0));
        assert!(t.is_complete());
    }

    #[test]
    fn error_reply() {
        let mut t = ReplyTracker::new();
        t.track_query(&com_query("select nope"));
        t.process(&err_packet(1, 1054, "42S22", "Unknown column"));
        assert!(t.is_complete());
        assert_eq!(t.reply().error.as_ref().map(|e| e.code), Some(1054));
    }

    #[test]
    fn prepare_waits_for_definitions() {
        let mut t = ReplyTracker::new();
        t.track_query(&packet(0, b"\x16select ?, a from t"));
        // stmt id 1, 1 column, 1 param
        t.process(&packet(1, &[0, 1, 0, 0, 0, 1, 0, 1, 0, 0, 0, 0]));
        assert_eq!(t.state(), ReplyState::Prepare);
        t.process(&packet(2, b"param"));
        t.process(&eof_packet(3, 0));
        t.process(&packet(4, b"column"));
        assert_eq!(t.state(), ReplyState::Prepare);
        t.process(&eof_packet(5, 0));
        assert!(t.is_complete());
    }

    #[test]
    fn cursor_execute_ends_after_column_eof() {
        let mut t = ReplyTracker::new();
        t.track_query(&packet(0, &[COM_STMT_EXECUTE, 1, 0, 0, 0, CURSOR_TYPE_READ_ONLY, 1, 0, 0, 0]));
        t.process(&packet(1, &[1]));
        t.process(&packet(2, b"coldef"));
        t.process(&eof_packet(3, 0));
        assert!(t.is_complete());
    }

    #[test]
    fn commands_without_response() {
        let mut t = ReplyTracker::new();
        t.track_query(&protocol::com_quit());
        assert!(t.is_complete());
        t.track_query(&packet(0, &[COM_STMT_CLOSE, 1, 0, 0, 0]));
        assert!(t.is_complete());
    }

    #[test]
    fn statistics_is_a_single_packet() {
        let mut t = ReplyTracker::new();
        t.track_query(&packet(0, &[COM_STATISTICS]));
        t.process(&packet(1, b"Uptime: 5  Threads: 1"));
        assert!(t.is_complete());
    }

    #[test]
    fn large_row_tail_is_not_inspected() {
        let mut t = ReplyTracker::new();
        t.track_query(&com_query("select blob"));
        let mut buf = packet(1, &[1]);
        buf.extend(packet(2, b"coldef"));
        buf.extend(eof_packet(3, 0));
        // Row spanning two packets whose tail starts with 0xfe like an EOF.
        let mut big = vec![0u8; MAX_PAYLOAD_LEN];
        big[0] = 0xfc;
        protocol::write_packet(&mut buf, 4, &big);
        buf.truncate(buf.len() - HEADER_LEN);
        buf.extend(packet(5, &[EOF_HEADER, 0, 0, 0, 0]));
        t.process(&buf);
        assert_eq!(t.state(), ReplyState::RsetRows);
        assert_eq!(t.reply().rows, 1);
        t.process(&eof_packet(6, 0));
        assert!(t.is_complete());
    }
}
