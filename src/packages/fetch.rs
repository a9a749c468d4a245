use anyhow::Result;
use core::future::Future;
use core::pin::Pin;
use std::sync::Arc;

pub type PackageFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Fetches a single package (for example a container image) identified by an opaque string.
///
/// Implementations are invoked concurrently by the worker pool, once per item, with distinct
/// items. The runner never retries; wrap the fetcher with
/// [`RetryingFetch`](crate::packages::retry::RetryingFetch) when retries are wanted.
pub trait FetchPackage: Send + Sync + 'static {
    fn fetch<'a>(&'a self, item: &'a str) -> PackageFuture<'a>;
}

impl<T: FetchPackage + ?Sized> FetchPackage for Arc<T> {
    fn fetch<'a>(&'a self, item: &'a str) -> PackageFuture<'a> {
        (**self).fetch(item)
    }
}

impl FetchPackage for Box<dyn FetchPackage> {
    fn fetch<'a>(&'a self, item: &'a str) -> PackageFuture<'a> {
        (**self).fetch(item)
    }
}

/// Closure-backed [`FetchPackage`] created by [`fetch_fn`].
pub struct FnFetcher<F> {
    f: F,
}

/// Adapts an async closure taking the owned item identifier into a [`FetchPackage`].
pub fn fetch_fn<F, Fut>(f: F) -> FnFetcher<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnFetcher { f }
}

impl<F, Fut> FetchPackage for FnFetcher<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn fetch<'a>(&'a self, item: &'a str) -> PackageFuture<'a> {
        Box::pin((self.f)(item.to_owned()))
    }
}
