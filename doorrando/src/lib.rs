// The changes suggested by this lint usually make the code more cluttered and less clear:
#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]

pub mod balance;
pub mod error;
pub mod generate;
pub mod key_logic;
pub mod randomize;
pub mod settings;
pub mod spoiler_log;
pub mod traverse;
