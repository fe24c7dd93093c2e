//! Port forwarding to services listening on the plugin's own loopback.

use std::net::{Ipv4Addr, TcpStream};
use std::time::Duration;

use omniview_plugins::networker::{PortForwardOptions, PortForwardTarget, PortForwarder, Upstream};
use omniview_plugins::{PluginContext, RpcStatus};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards `demo::v1::Item` ports to `127.0.0.1:<remote_port>`.
#[derive(Debug, Clone)]
pub struct LoopbackForwarder {
    resource_key: String,
}

impl LoopbackForwarder {
    /// Forwarder for `resource_key`.
    #[must_use]
    pub fn new(resource_key: impl Into<String>) -> Self {
        Self {
            resource_key: resource_key.into(),
        }
    }
}

impl PortForwarder for LoopbackForwarder {
    fn target(&self) -> PortForwardTarget {
        PortForwardTarget {
            resource_key: self.resource_key.clone(),
            label: String::from("Forward port"),
            description: String::from("Connects to a port on the plugin host's loopback"),
        }
    }

    fn dial(&self, _ctx: &PluginContext, options: &PortForwardOptions) -> Result<Upstream, RpcStatus> {
        let address = (Ipv4Addr::LOCALHOST, options.remote_port).into();
        let stream = TcpStream::connect_timeout(&address, DIAL_TIMEOUT).map_err(|error| {
            RpcStatus::unavailable(format!("cannot reach {address}: {error}"))
        })?;
        let reader = stream
            .try_clone()
            .map_err(|error| RpcStatus::internal(error.to_string()))?;
        Ok((Box::new(reader), Box::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use rstest::rstest;

    use super::*;

    fn options(remote_port: u16) -> PortForwardOptions {
        PortForwardOptions {
            resource_key: String::from("demo::v1::Item"),
            resource_id: String::from("alpha"),
            remote_port,
            ..PortForwardOptions::default()
        }
    }

    #[rstest]
    fn dials_the_loopback_port() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let echo = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = [0_u8; 4];
            stream.read_exact(&mut buf).expect("read");
            stream.write_all(&buf).expect("write");
        });

        let forwarder = LoopbackForwarder::new("demo::v1::Item");
        let (mut reader, mut writer) = forwarder
            .dial(&PluginContext::new("tester"), &options(port))
            .expect("dial");
        writer.write_all(b"ping").expect("send");
        let mut reply = [0_u8; 4];
        reader.read_exact(&mut reply).expect("receive");
        assert_eq!(&reply, b"ping");
        echo.join().expect("echo thread");
    }

    #[rstest]
    fn unreachable_ports_are_unavailable() {
        let port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .and_then(|listener| listener.local_addr())
            .expect("free port")
            .port();
        let Err(status) =
            LoopbackForwarder::new("demo::v1::Item").dial(&PluginContext::new("tester"), &options(port))
        else {
            panic!("closed port accepted a connection");
        };
        assert_eq!(status.code, omniview_plugins::StatusCode::Unavailable);
    }
}
