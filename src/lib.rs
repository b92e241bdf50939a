//! Google Drive sync core for a notes app: credentials, OAuth2, a Drive v3
//! REST client, the folder/note reconciler and the sync state machine.

pub mod storage;
pub mod sync;
