//! Integration tests with mock HTTP servers

mod integration {
    pub mod adapters;
    pub mod mock_server;
    pub mod routing;
    pub mod selftest;
}
