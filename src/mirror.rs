//! Application context tying the mirror together.
//!
//! A [`Mirror`] owns the request dispatcher, the collection database, the
//! settings and the authenticated user. View code receives it explicitly
//! instead of reaching for ambient state; the connection layer feeds every
//! backend message into [`Mirror::receive`].

use std::rc::Rc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app_response::AppResponse;
use crate::collection::Collection;
use crate::config::{MirrorConfig, ACCOUNT_CHANNEL, SETTINGS_CHANNEL, USERS_COLLECTION};
use crate::database::{Database, PushMessage, PushOperation};
use crate::dispatcher::{Dispatcher, ResponseMessage, Transport};
use crate::document::Document;
use crate::settings::Settings;
use crate::user::User;

/// Anything the backend sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Push(PushMessage),
    Response(ResponseMessage),
}

pub struct Mirror {
    dispatcher: Rc<Dispatcher>,
    database: Database,
    settings: Settings,
    user: User,
}

impl Mirror {
    pub fn open(config: &MirrorConfig, transport: Rc<dyn Transport>) -> Result<Self, AppResponse> {
        let dispatcher = Rc::new(Dispatcher::new(transport));
        let database = Database::open(config, dispatcher.clone())?;

        Ok(Self {
            settings: Settings::new(dispatcher.clone()),
            user: User::new(),
            dispatcher,
            database,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn collection(&self, name: &str) -> Option<Rc<Collection>> {
        self.database.collection(name)
    }

    pub fn receive_json(&self, json: &str) -> Result<(), AppResponse> {
        let message: InboundMessage = serde_json::from_str(json)?;
        self.receive(message)
    }

    /// Routes one backend message. Messages are applied in the order they
    /// are received.
    pub fn receive(&self, message: InboundMessage) -> Result<(), AppResponse> {
        match message {
            InboundMessage::Response(response) => {
                self.dispatcher.resolve(response);
                Ok(())
            }
            InboundMessage::Push(push) => self.route_push(push),
        }
    }

    fn route_push(&self, push: PushMessage) -> Result<(), AppResponse> {
        match (push.collection.as_str(), push.operation) {
            (SETTINGS_CHANNEL, PushOperation::Update) => {
                self.settings.update(&push.data)?;
                Ok(())
            }
            (ACCOUNT_CHANNEL, PushOperation::Update) => {
                if self.user.is_authorized() {
                    self.user.load(&push.data)?;
                } else {
                    self.user.authorize(&push.data)?;
                }
                Ok(())
            }
            (ACCOUNT_CHANNEL, PushOperation::Logout) => self.user.logout(),
            (SETTINGS_CHANNEL | ACCOUNT_CHANNEL, operation) => Err(AppResponse::BadRequest(
                format!("Operation {operation:?} is not valid for '{}'", push.collection),
            )),
            _ => {
                let applied = self.database.apply(&push)?;
                if push.collection == USERS_COLLECTION && push.operation == PushOperation::Update {
                    self.refresh_user(&applied.documents)?;
                }
                Ok(())
            }
        }
    }

    /// Loads the signed-in user's document into [`User`] if the push
    /// actually changed it.
    fn refresh_user(&self, documents: &[Document]) -> Result<(), AppResponse> {
        let Some(current) = self.user.id() else {
            return Ok(());
        };

        for document in documents {
            if document.id().as_deref() == Some(current.as_str()) {
                self.user.load(&document.clone().into_value())?;
            }
        }

        Ok(())
    }

    /// Page-unload teardown.
    pub fn unload(&self) -> Result<(), AppResponse> {
        self.database.unload()
    }

    /// Unloads and fails every request still waiting on the backend.
    pub fn close(self) -> Result<(), AppResponse> {
        let failed = self.dispatcher.fail_all_pending("mirror closed");
        if failed > 0 {
            warn!("Closed mirror with {failed} pending request(s)");
        }
        self.database.unload()?;
        info!("Mirror closed");
        Ok(())
    }

    /// Full client-side reset: closes the mirror and deletes its local store.
    pub fn reset(self) -> Result<(), AppResponse> {
        self.dispatcher.fail_all_pending("mirror reset");
        self.database.delete_local_data()
    }
}
