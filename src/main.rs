//! RDMA write-then-notify push - main entry point
//!
//! The protocol runs between two binaries:
//! 1. The server registers a remotely writable buffer, listens, and embeds
//!    the buffer's address and remote key in its accept private payload.
//! 2. The client performs a one-sided write into that buffer, then sends an
//!    explicit notification so the server knows the data has landed.
//! 3. The server consumes the buffer only after observing the notification
//!    receive completion, and replies with the element count it accepted.
//!
//! ## Usage
//!
//! Start the server:
//! ```bash
//! cargo run --bin push-server -- --port 9191
//! ```
//!
//! Push a file:
//! ```bash
//! cargo run --bin push-client -- --server-addr 127.0.0.1 payload.bin
//! ```

fn main() {
    println!("RDMA write-then-notify push");
    println!();
    println!("Use the following binaries:");
    println!("  cargo run --bin push-server -- --help");
    println!("  cargo run --bin push-client -- --help");
}
