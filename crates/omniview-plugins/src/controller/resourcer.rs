//! Per-type resource implementations and their type-erased adapter.

use std::marker::PhantomData;

use super::client::{ClientTag, ConnectedClient};
use crate::context::PluginContext;
use crate::resource::{
    CreateInput, CreateResult, DeleteInput, DeleteResult, FindInput, FindResult, GetInput,
    GetResult, ListInput, ListResult, UpdateInput, UpdateResult,
};
use crate::rpc::RpcStatus;

/// CRUD for one resource type against a backend client of type `C`.
///
/// Only `get` and `list` are required; the remaining operations report
/// `unimplemented` unless overridden.
pub trait Resourcer<C>: Send + Sync {
    /// Fetches one object.
    ///
    /// # Errors
    ///
    /// Unrecoverable backend failures.
    fn get(&self, ctx: &PluginContext, client: &C, input: GetInput) -> Result<GetResult, RpcStatus>;

    /// Lists objects.
    ///
    /// # Errors
    ///
    /// Unrecoverable backend failures.
    fn list(&self, ctx: &PluginContext, client: &C, input: ListInput) -> Result<ListResult, RpcStatus>;

    /// Searches objects.
    ///
    /// # Errors
    ///
    /// `unimplemented` unless overridden.
    fn find(
        &self,
        _ctx: &PluginContext,
        _client: &C,
        _input: FindInput,
    ) -> Result<FindResult, RpcStatus> {
        Err(RpcStatus::unimplemented("find is not supported for this resource"))
    }

    /// Creates an object.
    ///
    /// # Errors
    ///
    /// `unimplemented` unless overridden.
    fn create(
        &self,
        _ctx: &PluginContext,
        _client: &C,
        _input: CreateInput,
    ) -> Result<CreateResult, RpcStatus> {
        Err(RpcStatus::unimplemented("create is not supported for this resource"))
    }

    /// Replaces an object.
    ///
    /// # Errors
    ///
    /// `unimplemented` unless overridden.
    fn update(
        &self,
        _ctx: &PluginContext,
        _client: &C,
        _input: UpdateInput,
    ) -> Result<UpdateResult, RpcStatus> {
        Err(RpcStatus::unimplemented("update is not supported for this resource"))
    }

    /// Deletes an object.
    ///
    /// # Errors
    ///
    /// `unimplemented` unless overridden.
    fn delete(
        &self,
        _ctx: &PluginContext,
        _client: &C,
        _input: DeleteInput,
    ) -> Result<DeleteResult, RpcStatus> {
        Err(RpcStatus::unimplemented("delete is not supported for this resource"))
    }
}

/// One resource operation with its input.
#[derive(Debug)]
pub(crate) enum Operation {
    Get(GetInput),
    List(ListInput),
    Find(FindInput),
    Create(CreateInput),
    Update(UpdateInput),
    Delete(DeleteInput),
}

impl Operation {
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Get(_) => "get",
            Self::List(_) => "list",
            Self::Find(_) => "find",
            Self::Create(_) => "create",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
        }
    }
}

/// What an [`Operation`] produced.
#[derive(Debug)]
pub(crate) enum Outcome {
    One(GetResult),
    Many(ListResult),
}

/// A resourcer with its client type erased.
pub(crate) trait ErasedResourcer: Send + Sync {
    fn client_tag(&self) -> ClientTag;

    fn invoke(
        &self,
        ctx: &PluginContext,
        client: &ConnectedClient,
        operation: Operation,
    ) -> Result<Outcome, RpcStatus>;
}

pub(crate) struct TypedResourcer<C, R> {
    resourcer: R,
    client: PhantomData<fn() -> C>,
}

impl<C, R> TypedResourcer<C, R> {
    pub(crate) const fn new(resourcer: R) -> Self {
        Self {
            resourcer,
            client: PhantomData,
        }
    }
}

impl<C, R> ErasedResourcer for TypedResourcer<C, R>
where
    C: Send + Sync + 'static,
    R: Resourcer<C>,
{
    fn client_tag(&self) -> ClientTag {
        ClientTag::of::<C>()
    }

    fn invoke(
        &self,
        ctx: &PluginContext,
        client: &ConnectedClient,
        operation: Operation,
    ) -> Result<Outcome, RpcStatus> {
        let Some(typed) = client.downcast::<C>() else {
            return Err(RpcStatus::failed_precondition(format!(
                "client type mismatch: expected {}, got {}",
                self.client_tag(),
                client.tag()
            )));
        };
        match operation {
            Operation::Get(input) => self.resourcer.get(ctx, typed, input).map(Outcome::One),
            Operation::List(input) => self.resourcer.list(ctx, typed, input).map(Outcome::Many),
            Operation::Find(input) => self.resourcer.find(ctx, typed, input).map(Outcome::Many),
            Operation::Create(input) => self.resourcer.create(ctx, typed, input).map(Outcome::One),
            Operation::Update(input) => self.resourcer.update(ctx, typed, input).map(Outcome::One),
            Operation::Delete(input) => self.resourcer.delete(ctx, typed, input).map(Outcome::One),
        }
    }
}
