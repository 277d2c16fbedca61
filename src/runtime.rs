use std::{future::Future, time::Duration};

#[cfg(not(any(feature = "tokio", feature = "smol")))]
compile_error!("enable one of the `tokio` or `smol` features to select an async runtime");

#[cfg(feature = "tokio")]
pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[cfg(all(feature = "smol", not(feature = "tokio")))]
pub(crate) async fn sleep(duration: Duration) {
    smol::Timer::after(duration).await;
}

/// Run `fut` in the background. Returns `false` if no runtime could take it.
#[cfg(feature = "tokio")]
pub(crate) fn spawn_task<F>(fut: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
            true
        }
        Err(_) => false,
    }
}

#[cfg(all(feature = "smol", not(feature = "tokio")))]
pub(crate) fn spawn_task<F>(fut: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    smol::spawn(fut).detach();
    true
}
