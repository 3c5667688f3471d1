//! Demo `UserService` served by `kestrel provider`.

use kestrel_server::{Dispatcher, Payload, ServiceFailure};
use serde::{Deserialize, Serialize};

pub const SERVICE_NAME: &str = "UserService";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
}

/// `getUser(id)` returns a generated user, `echo(message)` returns its
/// argument tagged with the provider name.
pub fn user_service(provider_name: &str) -> Dispatcher {
    let provider_name = provider_name.to_string();
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .register(SERVICE_NAME, "getUser", |params| async move {
            let id: u64 = params.get(0)?;
            if id == 0 {
                return Err(ServiceFailure::application("no user with id 0"));
            }
            Payload::new(&User {
                id,
                name: format!("user-{}", id),
            })
        })
        .register(SERVICE_NAME, "echo", move |params| {
            let provider_name = provider_name.clone();
            async move {
                let message: String = params.get(0)?;
                Payload::new(&format!("[{}] {}", provider_name, message))
            }
        });
    dispatcher
}
