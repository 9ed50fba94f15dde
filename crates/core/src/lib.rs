//! VoiceRAG Core
//!
//! Domain library for the VoiceRAG gateway: credential selection for the
//! Azure endpoints, the search-index client, the RAG tools, and the realtime
//! middle tier that answers a user message with the help of those tools.

pub mod credentials;
pub mod rag;
pub mod realtime;
pub mod search;
pub mod tools;
