//! Flow Mock Backend - stand-in for the real backend in tests and local runs.
//!
//! Speaks the same framing as the real backend on the endpoint it is given,
//! answers a handful of methods and can push notifications on request:
//!
//! | method            | behavior                                         |
//! |-------------------|--------------------------------------------------|
//! | `Config`, `StartUp`, `CreateDevice` | succeed                        |
//! | `CreateAccount`   | succeeds unless `Username` is `taken`            |
//! | `Echo`            | returns its params                               |
//! | `Delay`           | sleeps `Millis`, returns `Value`                 |
//! | `Fail`            | error response with `Message`                    |
//! | `Notify`          | pushes `{type: Type, data: Data}`, then succeeds |
//! | `Hang`            | never answers                                    |
//! | `Disconnect`      | exits without answering                          |
//! | `Detach`          | closes the channel but keeps running             |
//! | `AccountId`, `EnumerateOrgs` | canned answers                        |

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "flow-mock-backend")]
#[command(about = "Mock Flow backend speaking the client wire protocol")]
struct Args {
    /// Storage directory of the session
    #[arg(long)]
    data_dir: PathBuf,

    /// Endpoint to listen on
    #[arg(long)]
    endpoint: String,

    /// Wait this long before binding the endpoint
    #[arg(long, default_value = "0")]
    bind_delay_ms: u64,

    /// Exit with failure instead of binding
    #[arg(long)]
    fail_start: bool,

    /// Ignore SIGTERM and keep running after the client disconnects
    #[arg(long)]
    ignore_sigterm: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> ExitCode {
    use tracing_subscriber::EnvFilter;

    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    match mock::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "mock backend failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(unix))]
fn main() -> ExitCode {
    let _ = Args::parse();
    eprintln!("flow-mock-backend only runs on unix");
    ExitCode::FAILURE
}

#[cfg(unix)]
mod mock {
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::{debug, info, warn};

    use flow_client::codec::MsgPackCodec;
    use flow_client::protocol::{ErrorPayload, Header, NotificationPayload, Request};
    use flow_client::transport::{FrameReader, PipeListener};
    use flow_client::writer::{spawn_writer_task_default, OutboundFrame, WriterHandle};
    use flow_client::{FlowError, Result};

    use super::Args;

    enum Reply {
        Result(Value),
        Error(String),
        Silent,
    }

    pub async fn run(args: Args) -> Result<()> {
        if args.fail_start {
            return Err(FlowError::Launch("asked to fail start-up".into()));
        }
        if args.ignore_sigterm {
            let mut terms = signal(SignalKind::terminate())?;
            tokio::spawn(async move {
                while terms.recv().await.is_some() {
                    warn!("ignoring SIGTERM");
                }
            });
        }
        if args.bind_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.bind_delay_ms)).await;
        }

        let listener = PipeListener::bind(&args.endpoint).await?;
        info!(endpoint = %args.endpoint, data_dir = %args.data_dir.display(), "listening");

        let stream = listener.accept().await?;
        let (read_half, write_half) = stream.into_split();
        let (writer, _writer_task) = spawn_writer_task_default(write_half);
        let mut reader = FrameReader::new(read_half);
        let mut detached = false;

        while let Some(frame) = reader.receive().await? {
            if !frame.header.is_to_backend() || frame.call_id() == 0 {
                warn!(flags = frame.header.flags, "ignoring frame that is not a request");
                continue;
            }
            let request: Request = match MsgPackCodec::decode(frame.payload()) {
                Ok(request) => request,
                Err(e) => {
                    send_reply(&writer, frame.call_id(), Reply::Error(e.to_string())).await;
                    continue;
                }
            };

            if request.method == "Detach" {
                info!("detach requested, closing the channel");
                detached = true;
                break;
            }

            let call_id = frame.call_id();
            let writer = writer.clone();
            let data_dir = args.data_dir.clone();
            tokio::spawn(async move {
                debug!(call_id, method = %request.method, "request");
                let reply = handle(request, &writer, &data_dir).await;
                send_reply(&writer, call_id, reply).await;
            });
        }

        drop(reader);
        drop(writer);
        if !detached {
            info!("client closed the channel");
        }
        if detached || args.ignore_sigterm {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn handle(request: Request, writer: &WriterHandle, data_dir: &std::path::Path) -> Reply {
        let params = request.params;
        match request.method.as_str() {
            "Config" | "StartUp" | "CreateDevice" => Reply::Result(Value::Null),
            "CreateAccount" => {
                if params["Username"] == "taken" {
                    Reply::Error("username already registered".into())
                } else {
                    Reply::Result(Value::Null)
                }
            }
            "Echo" => Reply::Result(params),
            "Delay" => {
                let millis = params["Millis"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Reply::Result(params["Value"].clone())
            }
            "Fail" => Reply::Error(
                params["Message"]
                    .as_str()
                    .unwrap_or("failure requested")
                    .to_string(),
            ),
            "Notify" => {
                let payload = NotificationPayload {
                    category: params["Type"].as_str().unwrap_or("message").to_string(),
                    data: params["Data"].clone(),
                };
                match send_payload(writer, Header::notification, &payload).await {
                    Ok(()) => Reply::Result(Value::Null),
                    Err(e) => Reply::Error(e.to_string()),
                }
            }
            "Hang" => Reply::Silent,
            "Disconnect" => {
                info!("disconnect requested, exiting");
                std::process::exit(0);
            }
            "AccountId" => Reply::Result(json!(format!(
                "acct-{}",
                data_dir
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ))),
            "EnumerateOrgs" => Reply::Result(json!([{ "id": "o1", "name": "Mock Org" }])),
            other => Reply::Error(format!("unknown method {}", other)),
        }
    }

    async fn send_reply(writer: &WriterHandle, call_id: u32, reply: Reply) {
        let sent = match reply {
            Reply::Result(value) => {
                send_payload(writer, |len| Header::response(call_id, len), &value).await
            }
            Reply::Error(message) => {
                send_payload(
                    writer,
                    |len| Header::error_response(call_id, len),
                    &ErrorPayload { message },
                )
                .await
            }
            Reply::Silent => Ok(()),
        };
        if let Err(e) = sent {
            warn!(call_id, error = %e, "failed to send reply");
        }
    }

    async fn send_payload<T, F>(writer: &WriterHandle, header: F, body: &T) -> Result<()>
    where
        T: serde::Serialize,
        F: FnOnce(u32) -> Header,
    {
        let payload = MsgPackCodec::encode_bytes(body)?;
        let header = header(payload.len() as u32);
        writer.send(OutboundFrame::new(&header, payload)).await
    }
}
