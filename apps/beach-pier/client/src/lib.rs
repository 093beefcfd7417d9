//! Terminal-side helpers for the `beach-pier` channel: the heartbeat
//! sentinel, scheduler tick frames, and decoding of the scheduling
//! directives the server sends.

use beach_pier_core::{
    decode_records, encode_to_vec, ClientToServerModel, Record, ServerToClientModel, WireError,
    CLIENT_HEARTBEAT_TEXT,
};

/// Text frame that keeps the socket alive.
pub fn heartbeat_text() -> &'static str {
    CLIENT_HEARTBEAT_TEXT
}

/// Builds the frame sent when a scheduled command's period elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickBuilder {
    command_id: u64,
    window: Option<i32>,
    fix_delay: Option<i32>,
}

impl TickBuilder {
    pub fn new(command_id: u64) -> Self {
        Self {
            command_id,
            window: None,
            fix_delay: None,
        }
    }

    /// Asks the server to re-arm the command as fixed-delay.
    pub fn with_delay(mut self, delay_ms: i32) -> Self {
        self.fix_delay = Some(delay_ms);
        self
    }

    pub fn in_window(mut self, window: i32) -> Self {
        self.window = Some(window);
        self
    }

    pub fn records(&self) -> Vec<Record<ClientToServerModel>> {
        let mut records = vec![Record::marker(ClientToServerModel::HandlerKeyScheduler)];
        if let Some(window) = self.window {
            records.push(Record::new(ClientToServerModel::WindowId, window));
        }
        records.push(Record::new(
            ClientToServerModel::CommandId,
            self.command_id as i64,
        ));
        if let Some(delay) = self.fix_delay {
            records.push(Record::new(ClientToServerModel::FixDelay, delay));
        }
        records
    }

    pub fn encode(&self) -> Vec<u8> {
        // Every record is built with the value type its key declares.
        encode_to_vec(&self.records()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    FixRate(u32),
    FixDelay(u32),
    Stop,
}

/// One scheduling instruction from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directive {
    pub window: Option<i32>,
    pub command_id: u64,
    pub kind: DirectiveKind,
}

/// Extracts the directives carried by a server frame. Heartbeats and records
/// unrelated to scheduling are skipped; a period or stop with no preceding
/// command id is ignored.
pub fn parse_directives(bytes: &[u8]) -> Result<Vec<Directive>, WireError> {
    let mut directives = Vec::new();
    let mut window = None;
    let mut command_id = None;

    for record in decode_records::<ServerToClientModel>(bytes)? {
        let value = record.value.as_i64();
        let kind = match (record.key, value) {
            (ServerToClientModel::WindowId, Some(v)) => {
                window = Some(v as i32);
                continue;
            }
            (ServerToClientModel::CommandId, Some(v)) => {
                command_id = Some(v as u64);
                continue;
            }
            (ServerToClientModel::FixRate, Some(v)) => DirectiveKind::FixRate(v.max(0) as u32),
            (ServerToClientModel::FixDelay, Some(v)) => DirectiveKind::FixDelay(v.max(0) as u32),
            (ServerToClientModel::Stop, _) => DirectiveKind::Stop,
            _ => continue,
        };

        if let Some(command_id) = command_id.take() {
            directives.push(Directive {
                window: window.take(),
                command_id,
                kind,
            });
        }
    }

    Ok(directives)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beach_pier_core::{Value, HEARTBEAT_FRAME};

    #[test_timeout::timeout]
    fn tick_frame_layout() {
        let bytes = TickBuilder::new(1).encode();
        assert_eq!(bytes, vec![0, 1, 0, 2, 0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test_timeout::timeout]
    fn tick_with_window_and_delay() {
        let records = TickBuilder::new(3).in_window(8).with_delay(50).records();
        let keys: Vec<_> = records.iter().map(|r| r.key).collect();
        assert_eq!(
            keys,
            vec![
                ClientToServerModel::HandlerKeyScheduler,
                ClientToServerModel::WindowId,
                ClientToServerModel::CommandId,
                ClientToServerModel::FixDelay,
            ]
        );
        assert_eq!(records[3].value, Value::Integer(50));
    }

    #[test_timeout::timeout]
    fn parses_directives_and_skips_heartbeats() {
        let mut bytes = HEARTBEAT_FRAME.to_vec();
        bytes.extend(
            encode_to_vec(&[
                Record::new(ServerToClientModel::CommandId, 1i64),
                Record::new(ServerToClientModel::FixRate, 1000),
                Record::new(ServerToClientModel::Index, 4),
                Record::new(ServerToClientModel::WindowId, 2),
                Record::new(ServerToClientModel::CommandId, 1i64),
                Record::marker(ServerToClientModel::Stop),
            ])
            .expect("encode"),
        );

        let directives = parse_directives(&bytes).expect("parse");

        assert_eq!(
            directives,
            vec![
                Directive {
                    window: None,
                    command_id: 1,
                    kind: DirectiveKind::FixRate(1000),
                },
                Directive {
                    window: Some(2),
                    command_id: 1,
                    kind: DirectiveKind::Stop,
                },
            ]
        );
    }

    #[test_timeout::timeout]
    fn heartbeat_sentinel() {
        assert_eq!(heartbeat_text(), "0");
    }
}
