//! Unit tests for port forwarding.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use rstest::{fixture, rstest};
use serde_json::json;

use super::*;
use crate::context::Connection;
use crate::rpc::StatusCode;

const POD: &str = "core::v1::Pod";

/// Echo server standing in for the container port.
fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind echo server");
    let addr = listener.local_addr().expect("echo address");
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { return };
            thread::spawn(move || {
                let mut reader = stream.try_clone().expect("clone echo stream");
                drop(std::io::copy(&mut reader, &mut stream));
            });
        }
    });
    addr
}

/// Dials the echo server for pods.
struct PodForwarder {
    upstream: SocketAddr,
    dials: AtomicUsize,
}

impl PortForwarder for PodForwarder {
    fn target(&self) -> PortForwardTarget {
        PortForwardTarget {
            resource_key: POD.to_owned(),
            label: "Forward port".to_owned(),
            description: String::new(),
        }
    }

    fn dial(&self, _ctx: &PluginContext, _options: &PortForwardOptions) -> Result<Upstream, RpcStatus> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let stream = TcpStream::connect(self.upstream)
            .map_err(|err| RpcStatus::unavailable(err.to_string()))?;
        let reader = stream
            .try_clone()
            .map_err(|err| RpcStatus::internal(err.to_string()))?;
        Ok((Box::new(reader), Box::new(stream)))
    }
}

#[fixture]
fn forwarder() -> Arc<PodForwarder> {
    Arc::new(PodForwarder {
        upstream: echo_server(),
        dials: AtomicUsize::new(0),
    })
}

fn manager_with(forwarder: &Arc<PodForwarder>) -> PortForwardManager {
    PortForwardManager::new().with_forwarder(Arc::clone(forwarder) as Arc<dyn PortForwarder>)
}

fn options(resource_id: &str, labels: &[(&str, &str)]) -> PortForwardOptions {
    PortForwardOptions {
        resource_key: POD.to_owned(),
        resource_id: resource_id.to_owned(),
        resource_data: json!({ "name": resource_id }),
        remote_port: 8080,
        local_port: None,
        labels: labels
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect(),
    }
}

fn ctx() -> PluginContext {
    PluginContext::new("tests").with_connection(Connection::new("minikube", "Minikube"))
}

fn round_trip(port: u16, message: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("connect to forward");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream.write_all(message).expect("write through forward");
    let mut echoed = vec![0_u8; message.len()];
    stream.read_exact(&mut echoed).expect("read echo");
    echoed
}

#[rstest]
fn forwards_traffic_both_ways(forwarder: Arc<PodForwarder>) {
    let manager = manager_with(&forwarder);

    let session = manager.start(&ctx(), options("web-0", &[])).expect("start");

    assert_ne!(session.local_port, 0);
    assert_eq!(session.connection_id.as_deref(), Some("minikube"));
    assert_eq!(round_trip(session.local_port, b"ping"), b"ping");
    assert_eq!(round_trip(session.local_port, b"again"), b"again");
    assert_eq!(forwarder.dials.load(Ordering::SeqCst), 2);
}

#[rstest]
fn close_stops_listening(forwarder: Arc<PodForwarder>) {
    let manager = manager_with(&forwarder);
    let session = manager.start(&ctx(), options("web-0", &[])).expect("start");

    let closed = manager.close(&session.id).expect("close");

    assert_eq!(closed, session);
    assert!(manager.list().is_empty());
    assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, session.local_port)).is_err());
    assert!(matches!(
        manager.close(&session.id),
        Err(ForwardError::SessionNotFound { .. })
    ));
}

#[rstest]
fn find_filters_by_resource_and_labels(forwarder: Arc<PodForwarder>) {
    let manager = manager_with(&forwarder);
    let web = manager
        .start(&ctx(), options("web-0", &[("app", "web")]))
        .expect("start web");
    let db = manager
        .start(&ctx(), options("db-0", &[("app", "db")]))
        .expect("start db");

    let by_resource = manager.find(&FindPortForwardSessions {
        resource_id: Some("db-0".to_owned()),
        ..FindPortForwardSessions::default()
    });
    let by_label = manager.find(&FindPortForwardSessions {
        labels: BTreeMap::from([("app".to_owned(), "web".to_owned())]),
        ..FindPortForwardSessions::default()
    });
    let by_connection = manager.find(&FindPortForwardSessions {
        connection_id: Some("other".to_owned()),
        ..FindPortForwardSessions::default()
    });

    assert_eq!(by_resource, vec![db]);
    assert_eq!(by_label, vec![web]);
    assert!(by_connection.is_empty());
    assert_eq!(manager.list().len(), 2);
}

#[rstest]
fn unknown_resource_type_is_not_found(forwarder: Arc<PodForwarder>) {
    let manager = manager_with(&forwarder);
    let request = PortForwardOptions {
        resource_key: "apps::v1::Deployment".to_owned(),
        ..options("web", &[])
    };

    let status = manager
        .start_session(&ctx(), request)
        .expect_err("no forwarder");

    assert_eq!(status.code, StatusCode::NotFound);
}

#[rstest]
fn taken_local_port_is_a_failed_precondition(forwarder: Arc<PodForwarder>) {
    let manager = manager_with(&forwarder);
    let occupied = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("occupy a port");
    let port = occupied.local_addr().expect("occupied address").port();

    let status = manager
        .start_session(
            &ctx(),
            PortForwardOptions {
                local_port: Some(port),
                ..options("web-0", &[])
            },
        )
        .expect_err("port is taken");

    assert_eq!(status.code, StatusCode::FailedPrecondition);
}

#[rstest]
fn reports_supported_targets(forwarder: Arc<PodForwarder>) {
    let manager = manager_with(&forwarder);

    let targets = manager.supported_targets(&ctx()).expect("targets");

    assert_eq!(targets, vec![forwarder.target()]);
}
