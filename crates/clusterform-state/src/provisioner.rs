//! Seam to the tool that realizes a document as infrastructure

use crate::error::Result;
use async_trait::async_trait;

/// Realizes or tears down the infrastructure a document describes
///
/// Implementations report any unsuccessful run as
/// [`StateError::ApplyFailure`](crate::StateError::ApplyFailure). A failed run
/// is total: callers never commit the document afterwards.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Bring infrastructure in line with `document`
    async fn apply(&self, document: &[u8]) -> Result<()>;

    /// Destroy the modules named in `targets`, or everything when empty
    async fn destroy(&self, document: &[u8], targets: &[String]) -> Result<()>;
}

#[async_trait]
impl<P: Provisioner + ?Sized> Provisioner for Box<P> {
    async fn apply(&self, document: &[u8]) -> Result<()> {
        (**self).apply(document).await
    }

    async fn destroy(&self, document: &[u8], targets: &[String]) -> Result<()> {
        (**self).destroy(document, targets).await
    }
}
