//! One authenticated control connection.
//!
//! # RPC discipline
//! 1. Open a new typed stream; the request-type constant is the stream type
//! 2. Write one JSON request, read one JSON response
//! 3. Drop the stream
//!
//! Server-initiated streams arrive on the accept loop: command streams are
//! dispatched to the command handler on their own task, everything typed
//! `PROXY` is handed back to the session layer for endpoint dispatch.

use std::time::Duration;

use na_mux::heartbeat::{self, OnBeat};
use na_mux::{MuxAcceptor, MuxError, MuxSession, TypedStream};
use na_protocol::frame::{self, FrameError};
use na_protocol::{
    Auth, AuthResp, Bind, BindLabel, BindLabelResp, BindResp, CommandResp, ProxyHeader,
    RemoteError, Restart, SrvInfo, SrvInfoResp, Stop, StopTunnel, Unbind, UnbindResp, Update,
    types,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::config::{CommandHandler, RemoteCommand};
use crate::errors::Error;

/// Handle to one live control connection.  Cheap to clone.
#[derive(Clone)]
pub(crate) struct RawSession {
    mux: MuxSession,
}

/// One server-originated proxy stream with its header already read.
pub(crate) struct ProxyConn {
    pub(crate) header: ProxyHeader,
    pub(crate) stream: TypedStream,
}

impl RawSession {
    /// Start a session over an established (TLS) transport.
    pub(crate) fn start<I>(io: I) -> (RawSession, RawAcceptor)
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mux, acceptor) = MuxSession::new(io, na_mux::Side::Client);
        (
            RawSession { mux: mux.clone() },
            RawAcceptor { mux, acceptor },
        )
    }

    pub(crate) async fn auth(&self, auth: &Auth) -> Result<AuthResp, Error> {
        let resp: AuthResp = self
            .rpc(types::AUTH, auth)
            .await
            .map_err(|e| Error::AuthLocal(e.to_string()))?;
        if resp.error.is_empty() {
            Ok(resp)
        } else {
            Err(Error::AuthRemote(RemoteError::parse(&resp.error)))
        }
    }

    pub(crate) async fn bind(&self, req: &Bind) -> Result<BindResp, Error> {
        let resp: BindResp = self.rpc(types::BIND, req).await?;
        if resp.error.is_empty() {
            Ok(resp)
        } else {
            Err(Error::Bind(RemoteError::parse(&resp.error)))
        }
    }

    pub(crate) async fn bind_label(&self, req: &BindLabel) -> Result<BindLabelResp, Error> {
        let resp: BindLabelResp = self.rpc(types::BIND_LABEL, req).await?;
        if resp.error.is_empty() {
            Ok(resp)
        } else {
            Err(Error::Bind(RemoteError::parse(&resp.error)))
        }
    }

    pub(crate) async fn unbind(&self, id: &str) -> Result<(), Error> {
        let resp: UnbindResp = self
            .rpc(types::UNBIND, &Unbind { id: id.to_owned() })
            .await?;
        if resp.error.is_empty() {
            Ok(())
        } else {
            Err(Error::Rpc(resp.error))
        }
    }

    pub(crate) async fn srv_info(&self) -> Result<SrvInfoResp, Error> {
        self.rpc(types::SRV_INFO, &SrvInfo {}).await
    }

    /// Spawn the heartbeat requester.  The requester closes the session on
    /// a missed tolerance window, after reporting a zero round-trip.
    pub(crate) fn start_heartbeat(
        &self,
        interval: Duration,
        tolerance: Duration,
        on_beat: OnBeat,
    ) -> tokio::task::JoinHandle<()> {
        let mux = self.mux.clone();
        tokio::spawn(async move {
            if let Err(e) = heartbeat::run_requester(mux, interval, tolerance, on_beat).await {
                debug!(error = %e, "heartbeat requester exited");
            }
        })
    }

    /// Close the underlying multiplex.  Safe to call repeatedly.
    pub(crate) fn close(&self) {
        self.mux.close();
    }

    pub(crate) async fn closed(&self) {
        self.mux.closed().await;
    }

    async fn rpc<Req, Resp>(&self, ty: u8, req: &Req) -> Result<Resp, Error>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut stream = self
            .open(ty)
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?;
        frame::write_frame(&mut stream, req)
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?;
        frame::read_frame(&mut stream)
            .await
            .map_err(|e| Error::Rpc(e.to_string()))
    }

    async fn open(&self, ty: u8) -> Result<TypedStream, MuxError> {
        self.mux.open_typed(ty).await
    }
}

/// Accept side of a raw session.
pub(crate) struct RawAcceptor {
    mux: MuxSession,
    acceptor: MuxAcceptor,
}

impl RawAcceptor {
    /// Block until the next proxy stream is ready.
    ///
    /// Command streams are handled internally; an error here means the
    /// multiplex is dead and the session must be replaced.
    pub(crate) async fn accept(
        &mut self,
        handler: Option<&CommandHandler>,
    ) -> Result<ProxyConn, Error> {
        loop {
            let mut stream = self
                .acceptor
                .accept()
                .await
                .map_err(|e| Error::Accept(e.to_string()))?;
            match stream.stream_type() {
                types::STOP | types::RESTART | types::UPDATE | types::STOP_TUNNEL => {
                    let handler = handler.cloned();
                    tokio::spawn(handle_command(stream, handler));
                }
                types::PROXY => match frame::read_frame::<_, ProxyHeader>(&mut stream).await {
                    Ok(header) => return Ok(ProxyConn { header, stream }),
                    // A bad header poisons only that stream.
                    Err(FrameError::Io(e)) => return Err(Error::Accept(e.to_string())),
                    Err(e) => {
                        warn!(error = %e, "dropping proxy stream with malformed header");
                    }
                },
                other => {
                    debug!(stream_type = other, "dropping stream with unexpected type");
                }
            }
        }
    }

    pub(crate) fn close(&self) {
        self.mux.close();
    }
}

/// Decode one command, run the handler on this (spawned) task, and write
/// the reply back on the same stream.
async fn handle_command(mut stream: TypedStream, handler: Option<CommandHandler>) {
    let ty = stream.stream_type();
    let command = match read_command(ty, &mut stream).await {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!(stream_type = ty, error = %e, "malformed server command");
            return;
        }
    };
    debug!(?command, "server command received");

    let error = match handler {
        Some(handler) => handler(command).err().unwrap_or_default(),
        None => "command not supported by this agent".to_owned(),
    };
    let resp = CommandResp { error };
    if let Err(e) = frame::write_frame(&mut stream, &resp).await {
        debug!(error = %e, "failed to reply to server command");
    }
}

async fn read_command(ty: u8, stream: &mut TypedStream) -> Result<RemoteCommand, FrameError> {
    Ok(match ty {
        types::STOP => {
            let _: Stop = frame::read_frame(stream).await?;
            RemoteCommand::Stop
        }
        types::RESTART => {
            let _: Restart = frame::read_frame(stream).await?;
            RemoteCommand::Restart
        }
        types::UPDATE => {
            let update: Update = frame::read_frame(stream).await?;
            RemoteCommand::Update {
                version: update.version,
                permit_major_version: update.permit_major_version,
            }
        }
        _ => {
            let stop: StopTunnel = frame::read_frame(stream).await?;
            RemoteCommand::StopTunnel {
                endpoint_id: stop.id,
                message: stop.message,
                error_code: stop.error_code,
            }
        }
    })
}
