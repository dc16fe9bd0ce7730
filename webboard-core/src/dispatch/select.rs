/// Generic synchronous selector.
///
/// It abstracts the way a request key picks its target: the mount point for a path, or the
/// servlet of a mount point for a path within it.
pub trait Select<K: ?Sized> {
    /// Select output which can be a reference or an owned type.
    ///
    /// Note you may use HRTB to put restrictions on the output type because of GAT.
    type Output<'a>
    where
        Self: 'a;
    type Error;

    fn select(&self, key: &K) -> Result<Self::Output<'_>, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoMatch;

impl std::fmt::Display for NoMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no match")
    }
}
