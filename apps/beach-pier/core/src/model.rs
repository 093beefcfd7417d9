use std::fmt;

/// Width class of the value that follows a model key on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    None,
    Short,
    Integer,
    Long,
    String,
}

impl ValueType {
    /// Fixed encoded width of the value, `None` for length-prefixed strings.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ValueType::None => Some(0),
            ValueType::Short => Some(2),
            ValueType::Integer => Some(4),
            ValueType::Long => Some(8),
            ValueType::String => None,
        }
    }
}

/// A model key is a small enumerant whose code leads every record.
pub trait ModelKey: Copy + Eq + fmt::Debug {
    fn code(self) -> u16;
    fn from_code(code: u16) -> Option<Self>;
    fn value_type(self) -> ValueType;
}

macro_rules! model_keys {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident = $code:literal => $ty:ident),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum $name {
            $($variant = $code),+
        }

        impl ModelKey for $name {
            fn code(self) -> u16 {
                self as u16
            }

            fn from_code(code: u16) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }

            fn value_type(self) -> ValueType {
                match self {
                    $($name::$variant => ValueType::$ty,)+
                }
            }
        }
    };
}

model_keys! {
    /// Keys the server writes toward the terminal.
    pub enum ServerToClientModel {
        Heartbeat = 0 => None,
        WindowResize = 1 => Integer,
        CommandId = 2 => Long,
        FixRate = 3 => Integer,
        FixDelay = 4 => Integer,
        Stop = 5 => None,
        Index = 6 => Integer,
        WindowId = 7 => Integer,
        ObjectId = 8 => Integer,
        Text = 9 => String,
        Flag = 10 => Short,
    }
}

model_keys! {
    /// Keys the terminal writes toward the server.
    pub enum ClientToServerModel {
        Heartbeat = 0 => None,
        HandlerKeyScheduler = 1 => None,
        CommandId = 2 => Long,
        FixDelay = 3 => Integer,
        WindowId = 4 => Integer,
        ObjectId = 5 => Integer,
        HandlerKey = 6 => Short,
        Text = 7 => String,
        Index = 8 => Integer,
    }
}

/// Text frame the terminal sends as its keepalive: the decimal code of
/// [`ClientToServerModel::Heartbeat`].
pub const CLIENT_HEARTBEAT_TEXT: &str = "0";

impl ClientToServerModel {
    /// Text form of the key.
    pub fn to_string_value(self) -> String {
        self.code().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    None,
    Short(i16),
    Integer(i32),
    Long(i64),
    String(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::None => ValueType::None,
            Value::Short(_) => ValueType::Short,
            Value::Integer(_) => ValueType::Integer,
            Value::Long(_) => ValueType::Long,
            Value::String(_) => ValueType::String,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Short(v) => Some(*v as i64),
            Value::Integer(v) => Some(*v as i64),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i16> for Value {
    fn from(value: i16) -> Self {
        Value::Short(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<K> {
    pub key: K,
    pub value: Value,
}

impl<K: ModelKey> Record<K> {
    pub fn new(key: K, value: impl Into<Value>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    pub fn marker(key: K) -> Self {
        Self {
            key,
            value: Value::None,
        }
    }
}

/// One outbound update: an ordered run of server-to-client records that is
/// always written into a single buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    records: Vec<Record<ServerToClientModel>>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: ServerToClientModel, value: impl Into<Value>) -> Self {
        self.records.push(Record::new(key, value));
        self
    }

    pub fn with_marker(mut self, key: ServerToClientModel) -> Self {
        self.records.push(Record::marker(key));
        self
    }

    pub fn push(&mut self, record: Record<ServerToClientModel>) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[Record<ServerToClientModel>] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
