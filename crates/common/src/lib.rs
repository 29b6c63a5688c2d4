// erdsync-common: wire protocol and domain types shared by the relay and clients

pub mod protocol;
pub mod types;
