// Wire protocol definitions.

pub mod ws;
