//! Apply port: where engine decisions turn into TCMS mutations.
//!
//! The engine is generic over [`ApplyPort`]. [`LiveApply`] forwards to the
//! gateway, [`SimulatedApply`] records the calls and hands out negative
//! placeholder IDs. Reads always go to the real gateway in both modes.

use std::cell::{Cell, RefCell};

use crate::entity::{ObjectId, TcmsClass};
use crate::gateway::{Fields, GatewayError, TcmsGateway};

pub trait ApplyPort {
    fn create(&self, class: TcmsClass, fields: &Fields) -> Result<ObjectId, GatewayError>;

    fn update(&self, class: TcmsClass, id: ObjectId, fields: &Fields) -> Result<(), GatewayError>;

    fn upload_attachment(
        &self,
        class: TcmsClass,
        id: ObjectId,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), GatewayError>;

    fn is_simulated(&self) -> bool;
}

pub struct LiveApply<'a> {
    gateway: &'a dyn TcmsGateway,
}

impl<'a> LiveApply<'a> {
    pub fn new(gateway: &'a dyn TcmsGateway) -> Self {
        Self { gateway }
    }
}

impl ApplyPort for LiveApply<'_> {
    fn create(&self, class: TcmsClass, fields: &Fields) -> Result<ObjectId, GatewayError> {
        let id = self.gateway.create(class, fields)?;
        tracing::info!(%class, id, "created");
        Ok(id)
    }

    fn update(&self, class: TcmsClass, id: ObjectId, fields: &Fields) -> Result<(), GatewayError> {
        self.gateway.update(class, id, fields)?;
        tracing::info!(%class, id, "updated");
        Ok(())
    }

    fn upload_attachment(
        &self,
        class: TcmsClass,
        id: ObjectId,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), GatewayError> {
        self.gateway.upload_attachment(class, id, name, bytes)?;
        tracing::info!(%class, id, file = name, "attachment uploaded");
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        false
    }
}

/// A mutating call recorded by [`SimulatedApply`].
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedCall {
    Create {
        class: TcmsClass,
        placeholder: ObjectId,
        fields: Fields,
    },
    Update {
        class: TcmsClass,
        id: ObjectId,
        fields: Fields,
    },
    Upload {
        class: TcmsClass,
        id: ObjectId,
        name: String,
        size: usize,
    },
}

#[derive(Debug, Default)]
pub struct SimulatedApply {
    calls: RefCell<Vec<SimulatedCall>>,
    next_placeholder: Cell<ObjectId>,
}

impl SimulatedApply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SimulatedCall> {
        self.calls.borrow().clone()
    }

    fn placeholder(&self) -> ObjectId {
        let next = self.next_placeholder.get() - 1;
        self.next_placeholder.set(next);
        next
    }
}

impl ApplyPort for SimulatedApply {
    fn create(&self, class: TcmsClass, fields: &Fields) -> Result<ObjectId, GatewayError> {
        let placeholder = self.placeholder();
        tracing::info!(%class, placeholder, "would create");
        self.calls.borrow_mut().push(SimulatedCall::Create {
            class,
            placeholder,
            fields: fields.clone(),
        });
        Ok(placeholder)
    }

    fn update(&self, class: TcmsClass, id: ObjectId, fields: &Fields) -> Result<(), GatewayError> {
        tracing::info!(%class, id, "would update");
        self.calls.borrow_mut().push(SimulatedCall::Update {
            class,
            id,
            fields: fields.clone(),
        });
        Ok(())
    }

    fn upload_attachment(
        &self,
        class: TcmsClass,
        id: ObjectId,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), GatewayError> {
        tracing::info!(%class, id, file = name, "would upload attachment");
        self.calls.borrow_mut().push(SimulatedCall::Upload {
            class,
            id,
            name: name.to_string(),
            size: bytes.len(),
        });
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}
