// Extractor system
//
// Per-host pluggable resolvers that turn a channel/page URL into a concrete
// stream descriptor (final URL + request headers + proxy endpoint kind).
// Site-specific extractors are registered through the factory-based
// registry; the generic extractor handles everything else, including
// manual single-hop redirect resolution for known redirectors.

pub mod error;
pub mod generic;
pub mod registry;
pub mod traits;

pub use error::ExtractorError;
pub use generic::GenericExtractor;
pub use registry::{ExtractorFactory, ExtractorRegistry};
pub use traits::{EndpointKind, Extractor, StreamDescriptor};
