//! Command codes carried in the second byte of every frame.

use std::fmt;

use crate::error::ProtoError;

macro_rules! commands {
    ($($name:ident = $code:literal,)*) => {
        /// A wire command. The set is closed: any byte outside it fails to
        /// decode with [`ProtoError::UnknownCommand`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Command {
            $($name = $code,)*
        }

        impl TryFrom<u8> for Command {
            type Error = ProtoError;

            fn try_from(code: u8) -> Result<Self, Self::Error> {
                match code {
                    $($code => Ok(Command::$name),)*
                    other => Err(ProtoError::UnknownCommand(other)),
                }
            }
        }

        impl Command {
            /// Every known command, in code order.
            pub const ALL: &'static [Command] = &[$(Command::$name,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Command::$name => stringify!($name),)*
                }
            }
        }
    };
}

commands! {
    HeartbeatRequest = 0x01,
    HeartbeatResponse = 0x02,
    Ping = 0x03,
    Pong = 0x04,

    WriteEvents = 0x82,
    WriteEventsCompleted = 0x83,
    DeleteStream = 0x8A,
    DeleteStreamCompleted = 0x8B,

    ReadEvent = 0xB0,
    ReadEventCompleted = 0xB1,
    ReadStreamEventsForward = 0xB2,
    ReadStreamEventsForwardCompleted = 0xB3,
    ReadStreamEventsBackward = 0xB4,
    ReadStreamEventsBackwardCompleted = 0xB5,
    ReadAllEventsForward = 0xB6,
    ReadAllEventsForwardCompleted = 0xB7,
    ReadAllEventsBackward = 0xB8,
    ReadAllEventsBackwardCompleted = 0xB9,

    SubscribeToStream = 0xC0,
    SubscriptionConfirmation = 0xC1,
    StreamEventAppeared = 0xC2,
    UnsubscribeFromStream = 0xC3,
    SubscriptionDropped = 0xC4,
    ConnectToPersistentSubscription = 0xC5,
    PersistentSubscriptionConfirmation = 0xC6,
    PersistentSubscriptionStreamEventAppeared = 0xC7,
    CreatePersistentSubscription = 0xC8,
    CreatePersistentSubscriptionCompleted = 0xC9,
    DeletePersistentSubscription = 0xCA,
    DeletePersistentSubscriptionCompleted = 0xCB,
    PersistentSubscriptionAckEvents = 0xCC,
    PersistentSubscriptionNakEvents = 0xCD,
    UpdatePersistentSubscription = 0xCE,
    UpdatePersistentSubscriptionCompleted = 0xCF,

    BadRequest = 0xF0,
    NotHandled = 0xF1,
    Authenticate = 0xF2,
    Authenticated = 0xF3,
    NotAuthenticated = 0xF4,
    IdentifyClient = 0xF5,
    ClientIdentified = 0xF6,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Connection-level traffic that never belongs to an operation or
    /// subscription.
    pub fn is_heartbeat(self) -> bool {
        matches!(
            self,
            Command::HeartbeatRequest | Command::HeartbeatResponse | Command::Ping | Command::Pong
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), self.code())
    }
}
