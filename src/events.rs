use k8s_openapi::api::core::v1::Event;
use kube::api::ListParams;
use kube::{Api, Client};
use serde_json::Value;

use crate::error::Result;
use crate::handler::to_response;

/// Events whose involved object is exactly `kind`/`name`.
///
/// The field selector narrows the list server-side; the same match is
/// applied again locally since not every API server honours it.
pub async fn involved_object_events(
    client: Client,
    namespace: Option<&str>,
    kind: &str,
    name: &str,
) -> Result<Value> {
    let api: Api<Event> = match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };
    let selector = format!("involvedObject.kind={kind},involvedObject.name={name}");
    let events = api
        .list(&ListParams::default().fields(&selector))
        .await?
        .items
        .into_iter()
        .filter(|event| {
            event.involved_object.kind.as_deref() == Some(kind)
                && event.involved_object.name.as_deref() == Some(name)
        })
        .collect::<Vec<_>>();
    to_response(&events)
}
