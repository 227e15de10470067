// Integration tests run against the in-process broker unless marked #[ignore]

mod common;
mod connection_test;
mod consumer_test;
mod producer_test;
