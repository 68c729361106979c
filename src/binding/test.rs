use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::Binding;
use crate::{
    channel::Channel,
    context::OperationContext,
    selection_criteria::{ReadPreference, ReadPreferenceOptions},
    test::{explicit_session, ok_response, MockCluster, MockConnection, MockServer},
    topology::{test_util::server_description, Cluster, Server, ServerAddress, ServerType},
};

fn nearest() -> ReadPreference {
    ReadPreference::Nearest {
        options: ReadPreferenceOptions::default(),
    }
}

#[tokio::test]
async fn split_binding_requires_a_shared_session() {
    let cluster = MockCluster::replica_set(vec![MockServer::new("a:27017", ServerType::RsPrimary)]);
    let (_, session) = explicit_session();
    let (_, other_session) = explicit_session();

    let read = Binding::read_preference(
        cluster.clone() as Arc<dyn Cluster>,
        nearest(),
        session.fork().unwrap(),
    );
    let write = Binding::writable(cluster.clone() as Arc<dyn Cluster>, other_session);
    let error = Binding::split(read, write).unwrap_err();
    assert!(error.is_invalid_argument());

    let read = Binding::read_preference(
        cluster.clone() as Arc<dyn Cluster>,
        nearest(),
        session.fork().unwrap(),
    );
    let write = Binding::writable(cluster as Arc<dyn Cluster>, session.fork().unwrap());
    let split = Binding::split(read, write).unwrap();
    assert!(split.session().unwrap().same_session(&session));
}

#[tokio::test]
async fn split_binding_routes_reads_and_writes_to_its_halves() {
    let primary = MockServer::new("primary:27017", ServerType::RsPrimary);
    let secondary = MockServer::new("secondary:27017", ServerType::RsSecondary);
    let cluster = MockCluster::replica_set(vec![secondary, primary]);
    let (_, session) = explicit_session();
    let ctx = OperationContext::unbounded();

    let read = Binding::read_preference(
        cluster.clone() as Arc<dyn Cluster>,
        ReadPreference::Secondary {
            options: ReadPreferenceOptions::default(),
        },
        session.fork().unwrap(),
    );
    let write = Binding::writable(cluster as Arc<dyn Cluster>, session.fork().unwrap());
    let split = Binding::split(read, write).unwrap();

    let read_source = split.read_channel_source(&ctx).await.unwrap();
    assert_eq!(
        read_source.server_description().unwrap().address,
        ServerAddress::parse("secondary:27017")
    );
    read_source.dispose();

    let write_source = split.write_channel_source(&ctx).await.unwrap();
    assert_eq!(
        write_source.server_description().unwrap().address,
        ServerAddress::parse("primary:27017")
    );
    write_source.dispose();
}

#[tokio::test]
async fn read_preference_binding_rejects_writes() {
    let cluster = MockCluster::replica_set(vec![MockServer::new("a:27017", ServerType::RsPrimary)]);
    let (_, session) = explicit_session();
    let binding = Binding::read_preference(cluster as Arc<dyn Cluster>, nearest(), session);

    let ctx = OperationContext::unbounded();
    let error = binding.write_channel_source(&ctx).await.unwrap_err();
    assert!(error.is_invalid_argument());
}

#[tokio::test]
async fn writable_binding_skips_non_writable_servers() {
    let secondary = MockServer::new("secondary:27017", ServerType::RsSecondary);
    let primary = MockServer::new("primary:27017", ServerType::RsPrimary);
    let cluster = MockCluster::replica_set(vec![secondary, primary]);
    let (_, session) = explicit_session();
    let binding = Binding::writable(cluster as Arc<dyn Cluster>, session);

    let ctx = OperationContext::unbounded();
    let source = binding.write_channel_source(&ctx).await.unwrap();
    assert_eq!(
        source.server_description().unwrap().address,
        ServerAddress::parse("primary:27017")
    );
    source.dispose();
}

#[tokio::test]
async fn disposed_binding_rejects_use_and_releases_its_session() {
    let cluster = MockCluster::replica_set(vec![MockServer::new("a:27017", ServerType::RsPrimary)]);
    let (pool, session) = explicit_session();
    let binding = Binding::writable(cluster as Arc<dyn Cluster>, session);

    binding.dispose();
    let ctx = OperationContext::unbounded();
    assert!(binding
        .read_channel_source(&ctx)
        .await
        .unwrap_err()
        .is_disposed());
    assert!(binding.session().unwrap_err().is_disposed());
    // The binding held the last handle, so its session is back in the pool.
    assert_eq!(pool.len(), 1);

    binding.dispose();
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn each_channel_source_is_independently_disposable() {
    let server = MockServer::new("a:27017", ServerType::RsPrimary);
    let cluster = MockCluster::replica_set(vec![server]);
    let (pool, session) = explicit_session();
    let binding = Binding::writable(cluster as Arc<dyn Cluster>, session);
    let ctx = OperationContext::unbounded();

    let first = binding.read_channel_source(&ctx).await.unwrap();
    let second = binding.read_channel_source(&ctx).await.unwrap();
    first.dispose();

    // Disposing one source leaves the other and the binding itself usable.
    assert!(second.server_description().is_ok());
    assert!(second.session().unwrap().same_session(binding.session().unwrap()));
    second.dispose();
    assert_eq!(pool.len(), 0);

    binding.dispose();
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn single_server_binding_pins_to_its_server() {
    let server = MockServer::new("pinned:27017", ServerType::RsSecondary);
    let (_, session) = explicit_session();
    let binding = Binding::server(server.clone() as Arc<dyn Server>, session);
    let ctx = OperationContext::unbounded();

    for source in [
        binding.read_channel_source(&ctx).await.unwrap(),
        binding.write_channel_source(&ctx).await.unwrap(),
    ] {
        assert_eq!(
            source.server_description().unwrap().address,
            ServerAddress::parse("pinned:27017")
        );
        source.dispose();
    }
}

#[tokio::test]
async fn channel_binding_forks_the_pinned_channel() {
    let connection = MockConnection::new("pinned:27017");
    connection.push_response(ok_response());
    let channel = Channel::new(
        Box::new(connection.clone()),
        server_description("pinned:27017", ServerType::RsPrimary),
    );
    let (_, session) = explicit_session();
    let binding = Binding::channel(channel, session);
    let ctx = OperationContext::unbounded();

    let source = binding.read_channel_source(&ctx).await.unwrap();
    let forked = source.channel(&ctx).await.unwrap();
    forked.dispose();
    source.dispose();
    // The connection stays open until the binding releases the original handle.
    assert_eq!(connection.close_count(), 0);

    binding.dispose();
    assert_eq!(connection.close_count(), 1);
}
