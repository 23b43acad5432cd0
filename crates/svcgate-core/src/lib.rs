// # svcgate-core
//
// Core library of the svcgate service-exposure reconciler.
//
// ## Architecture Overview
//
// Providers announce services; provisioners make them reachable. The core sits
// between them and walks every announced service through an ordered workflow:
// - **Workflow**: immutable pipeline of steps bounded by `undeployed` and `deployed`
// - **Entry**: per-service state machine instance
// - **TransitionEngine**: decides what a message does to an entry
// - **Dispatcher**: routes messages to entries and dispatches to extensions
// - **Housekeeper**: reaps closed entries, times out stalled dispatches
// - **Extension**: trait every provider and provisioner implements
// - **ExtensionRegistry**: plugin-based factory lookup by kind
// - **Engine**: owns all of the above and runs them until shutdown
//
// ## Design Principles
//
// 1. **Single writer per entry**: every mutation happens under the entry's own lock
// 2. **At most one in flight**: an entry never waits on two extensions at once
// 3. **Plugin-Based**: extensions are registered dynamically, no hard-coded if-else
// 4. **Library-First**: the daemon is a thin shell over this crate

pub mod config;
pub mod engine;
pub mod error;
pub mod extensions;
pub mod model;
pub mod registry;
pub mod state;
pub mod traits;
pub mod workflow;

// Re-export core types for convenience
pub use config::{CoreConfig, ExtensionConfig};
pub use engine::{Delivery, Engine, EngineEvent, Entry, Outcome};
pub use error::{Error, Result, TransitionError};
pub use model::{Action, Message, Service, Target};
pub use registry::ExtensionRegistry;
pub use state::SnapshotStore;
pub use traits::{Extension, ExtensionFactory};
pub use workflow::{DEPLOYED, Direction, UNDEPLOYED, Workflow};
