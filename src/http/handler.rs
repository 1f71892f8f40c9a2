use crate::http::exchange::Exchange;
use crate::io::socket::AsyncSocketIo;

/// Application callback invoked once per request, after the head is parsed.
///
/// The handler reads the body and writes the response through the
/// [`Exchange`]. Returning without responding produces a `500`. An error
/// returned before the response started is answered with a `500` and the
/// connection is closed; after that the connection is aborted.
///
/// One handler instance is shared by every worker thread.
#[allow(async_fn_in_trait)]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle<S: AsyncSocketIo>(&self, exchange: &mut Exchange<'_, S>) -> anyhow::Result<()>;
}
