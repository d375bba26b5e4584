pub mod backend;
pub mod error;
pub mod indexer;
pub mod name_maps;
pub mod scaling;
pub mod system;
/// The `mdao_core` crate provides the variable storage layer of a
/// multidisciplinary optimization framework: named, shaped views over flat
/// numeric buffers shared across a model hierarchy.
///
/// Key components:
/// - **Vector**: named access, relevance masking, complex-step mode and
///   physical/normalized scaling over one buffer.
/// - **Backends**: the numeric capability set solvers rely on
///   (`VectorBackend`), with dense and distributed variants.
/// - **System**: the slice of a hierarchy node a vector is built from
///   (variables, promotions, scale factors).
/// - **Transfer**: moving connected values between output and input vectors.
pub mod traits;
pub mod transfer;
pub mod value;
pub mod vector;
