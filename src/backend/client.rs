//! gRPC client for the job-execution backend.
//!
//! One client type serves all five services: the method path selects the
//! RPC, prost messages are encoded with the standard codec. The gateway
//! calls through [`BackendTransport`], implemented here for tonic channels.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Request, Status};

use crate::error::normalize_transport_status;

/// Items of a server-streaming call, boxed so they can move into relay tasks.
pub type BackendStream<T> = BoxStream<'static, Result<T, Status>>;

/// A client bound to one pooled channel.
#[derive(Clone)]
pub struct BackendClient {
    inner: Grpc<Channel>,
}

impl BackendClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: Grpc::new(channel),
        }
    }

    async fn ready(&mut self) -> Result<(), Status> {
        // A channel that can't become ready is a transport problem, not an
        // application answer.
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("channel not ready: {}", e)))
    }

    /// Execute a unary call.
    ///
    /// # Arguments
    /// * `path` - Fully qualified method path, e.g. `/jobdeck.v1.JobService/ListJobs`
    /// * `message` - The request message
    /// * `deadline` - Propagated to the backend as `grpc-timeout`
    pub async fn unary<Req, Resp>(
        mut self,
        path: &'static str,
        message: Req,
        deadline: Duration,
    ) -> Result<Resp, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.ready().await?;

        let mut request = Request::new(message);
        request.set_timeout(deadline);

        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        self.inner
            .unary(request, PathAndQuery::from_static(path), codec)
            .await
            .map(|response| response.into_inner())
            .map_err(normalize_transport_status)
    }

    /// Open a server-streaming call.
    ///
    /// Dropping the returned stream resets the HTTP/2 stream, which cancels
    /// the call on the backend.
    pub async fn server_streaming<Req, Resp>(
        mut self,
        path: &'static str,
        message: Req,
    ) -> Result<BackendStream<Resp>, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.ready().await?;

        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = self
            .inner
            .server_streaming(Request::new(message), PathAndQuery::from_static(path), codec)
            .await
            .map_err(normalize_transport_status)?;

        Ok(response
            .into_inner()
            .map(|item| item.map_err(normalize_transport_status))
            .boxed())
    }
}

/// What the gateway needs from a pooled channel.
pub trait BackendTransport: Clone + Send + Sync + 'static {
    fn unary<Req, Resp>(
        &self,
        path: &'static str,
        message: Req,
        deadline: Duration,
    ) -> BoxFuture<'static, Result<Resp, Status>>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static;

    fn server_streaming<Req, Resp>(
        &self,
        path: &'static str,
        message: Req,
    ) -> BoxFuture<'static, Result<BackendStream<Resp>, Status>>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static;
}

impl BackendTransport for Channel {
    fn unary<Req, Resp>(
        &self,
        path: &'static str,
        message: Req,
        deadline: Duration,
    ) -> BoxFuture<'static, Result<Resp, Status>>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        BackendClient::new(self.clone())
            .unary(path, message, deadline)
            .boxed()
    }

    fn server_streaming<Req, Resp>(
        &self,
        path: &'static str,
        message: Req,
    ) -> BoxFuture<'static, Result<BackendStream<Resp>, Status>>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        BackendClient::new(self.clone())
            .server_streaming(path, message)
            .boxed()
    }
}
