//! Pearsync core: the shared data model.
//!
//! This crate holds everything the other pearsync crates agree on:
//!
//! 1. **Keys** ([`keys`]): Ed25519 workspace/writer keys, hex rendering,
//!    topic derivation.
//!
//! 2. **Operations** ([`op`]): the tagged payload carried by every log
//!    block (`put`/`del`/`add-writer`/`remove-writer`) and the `FileMeta`
//!    value stored under each path.
//!
//! 3. **Ignore matching** ([`ignore`]): git-style pattern list applied to
//!    relative paths, with the built-in defaults and `.pearsyncignore`.
//!
//! 4. **Configuration** ([`config`], [`paths`]): the versioned JSON config
//!    file holding workspace aliases, and XDG path resolution.
//!
//! Nothing in here does I/O on the network or touches a log; those live in
//! `pearsync_log`, `pearsync_net` and `pearsync_engine`.

pub mod config;
pub mod ignore;
pub mod keys;
pub mod op;
pub mod paths;

pub use config::{Config, ConfigError, Defaults, WorkspaceEntry, CONFIG_VERSION};
pub use ignore::{IgnoreList, DEFAULT_IGNORE_PATTERNS, IGNORE_FILE_NAME};
pub use keys::{Keypair, KeyError, PublicKey, Signature, Topic, KEY_LEN, SIGNATURE_LEN};
pub use op::{content_hash, FileMeta, OpError, Operation};
