//! Variables, object properties and evaluation on paused frames

use serde_json::{json, Value};

use crate::cdp::{parse_params, CommandResult, EvaluateOnCallFrame, MessageId, ObjectIdParams, SessionId};
use crate::common::{Error, Result};
use crate::location::ObjectId;
use crate::relay::Relay;

use super::sandbox::{self, SandboxCommand};
use super::{Bridge, ExecutionContext};

/// Marker set on cached members found through `this`
const FROM_THIS: &str = "fromThis";

/// `Name` for an auto-property backing field `<Name>k__BackingField`
fn backing_field_name(name: &str) -> Option<&str> {
    name.strip_prefix('<')?.strip_suffix(">k__BackingField")
}

/// Show auto-property backing fields under their property names
fn clean_backing_fields(properties: &mut Value) {
    let Some(items) = properties.as_array_mut() else {
        return;
    };
    for item in items {
        let cleaned = item
            .get("name")
            .and_then(Value::as_str)
            .and_then(backing_field_name)
            .map(str::to_string);
        if let Some(name) = cleaned {
            item["name"] = Value::String(name);
        }
    }
}

fn find_named<'a>(items: &'a [Value], name: &str) -> Option<&'a Value> {
    items
        .iter()
        .find(|v| v.get("name").and_then(Value::as_str) == Some(name))
}

impl Bridge {
    /// Variables visible in frame `scope`, as the sandbox reports them
    ///
    /// Every variable is cached by name for the rest of the pause.
    pub(super) async fn get_scope_properties(
        &self,
        relay: &Relay,
        session: &SessionId,
        ctx: &ExecutionContext,
        scope: u32,
    ) -> Result<Vec<Value>> {
        let frame = ctx.frame(scope)?;
        let offset = frame.location.cli.as_ref().map(|c| c.offset).unwrap_or(0);
        let vars = frame.method.live_vars_at(offset);

        let result = sandbox::send(
            relay,
            session,
            SandboxCommand::GetScopeVariables {
                scope,
                vars: &vars,
            },
        )
        .await?;
        if let Some(error) = result.error_text() {
            return Err(Error::command_failed("Runtime.getProperties", &error));
        }

        let values = result
            .runtime_value()
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut variables = Vec::with_capacity(values.len());
        for (i, mut value) in values.into_iter().enumerate() {
            if value.get("value").is_none() {
                continue;
            }
            // Entries past the requested ones name themselves, like `this`
            let name = match vars.get(i) {
                Some(var) => var.name.clone(),
                None => match value.get("name").and_then(Value::as_str) {
                    Some(name) => name.to_string(),
                    None => continue,
                },
            };
            value["name"] = Value::String(name.clone());
            ctx.cache_local(scope, &name, value.clone());
            variables.push(value);
        }
        Ok(variables)
    }

    /// Properties of a sandbox object
    ///
    /// Value types are served from the pause cache after the first fetch.
    pub(super) async fn get_details(
        &self,
        relay: &Relay,
        session: &SessionId,
        ctx: &ExecutionContext,
        object: &ObjectId,
        args: &Value,
    ) -> Result<CommandResult> {
        let object_id = object.to_string();
        if matches!(object, ObjectId::ValueType(_)) {
            if let Some(cached) = ctx.cached_value_type(&object_id) {
                return Ok(CommandResult::Ok(json!({ "result": cached })));
            }
        }

        let result = sandbox::send(
            relay,
            session,
            SandboxCommand::GetDetails {
                object_id: &object_id,
                args,
            },
        )
        .await?;
        if result.is_err() {
            return Ok(result);
        }

        let mut properties = match object {
            ObjectId::CallFunctionResult(_) => {
                let encoded = result
                    .runtime_value()
                    .and_then(|v| v.get("__value_as_json_string__"))
                    .and_then(Value::as_str);
                match encoded {
                    Some(text) => serde_json::from_str(text).map_err(|e| {
                        Error::command_failed("Runtime.getProperties", &e.to_string())
                    })?,
                    None => json!({}),
                }
            }
            _ => result.runtime_value().cloned().unwrap_or_else(|| json!([])),
        };
        clean_backing_fields(&mut properties);

        if matches!(object, ObjectId::ValueType(_)) {
            ctx.cache_value_type(&object_id, properties.clone());
        }
        Ok(CommandResult::Ok(json!({ "result": properties })))
    }

    /// Find `name` among the frame's variables, then among the members of
    /// `this`
    ///
    /// Locals shadow members. With `only_this` the locals are skipped.
    pub(super) async fn lookup_variable(
        &self,
        relay: &Relay,
        session: &SessionId,
        ctx: &ExecutionContext,
        scope: u32,
        name: &str,
        only_this: bool,
    ) -> Result<Option<Value>> {
        if let Some(cached) = ctx.cached_local(scope, name) {
            if !only_this || cached.get(FROM_THIS).is_some() {
                return Ok(Some(cached));
            }
        }

        let variables = self.get_scope_properties(relay, session, ctx, scope).await?;
        if !only_this {
            if let Some(found) = find_named(&variables, name) {
                return Ok(Some(found.clone()));
            }
        }

        let this_id = find_named(&variables, "this")
            .and_then(|this| this.get("value"))
            .and_then(|v| v.get("objectId"))
            .and_then(Value::as_str)
            .and_then(ObjectId::parse);
        let Some(this_id) = this_id else {
            return Ok(None);
        };

        let details = self
            .get_details(relay, session, ctx, &this_id, &json!({}))
            .await?;
        let members = details
            .ok_value()
            .and_then(|v| v.get("result"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let Some(member) = find_named(members, name) else {
            return Ok(None);
        };

        let mut member = member.clone();
        member[FROM_THIS] = Value::Bool(true);
        if ctx.cached_local(scope, name).is_none() {
            ctx.cache_local(scope, name, member.clone());
        }
        Ok(Some(member))
    }

    pub(super) async fn evaluate_on_call_frame(
        &self,
        relay: &Relay,
        ctx: &ExecutionContext,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let args: EvaluateOnCallFrame = parse_params(method, params)?;
        let Some(ObjectId::Scope(scope)) = ObjectId::parse(&args.call_frame_id) else {
            return Ok(false);
        };
        let session = &id.session;
        let frame = ctx.frame(scope)?;

        let expression = args.expression.trim();
        let (name, only_this) = match expression.strip_prefix("this.") {
            Some(member) => (member, true),
            None => (expression, false),
        };

        if let Some(variable) = self
            .lookup_variable(relay, session, ctx, scope, name, only_this)
            .await?
        {
            relay.send_response(id, CommandResult::Ok(json!({ "result": variable["value"] })));
            return Ok(true);
        }

        let variables = self.get_scope_properties(relay, session, ctx, scope).await?;
        let value = self
            .evaluator
            .evaluate(&frame, expression, &variables)
            .await?;
        relay.send_response(
            id,
            CommandResult::Ok(json!({ "result": { "type": "string", "value": value } })),
        );
        Ok(true)
    }

    pub(super) async fn get_properties(
        &self,
        relay: &Relay,
        ctx: &ExecutionContext,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let args: ObjectIdParams = parse_params(method, params)?;
        let Some(object) = ObjectId::parse(&args.object_id) else {
            return Ok(false);
        };

        let result = match object {
            ObjectId::Scope(scope) => {
                let variables = self
                    .get_scope_properties(relay, &id.session, ctx, scope)
                    .await?;
                CommandResult::Ok(json!({ "result": variables }))
            }
            other => {
                self.get_details(relay, &id.session, ctx, &other, params)
                    .await?
            }
        };
        relay.send_response(id, result);
        Ok(true)
    }

    pub(super) async fn release_object(
        &self,
        relay: &Relay,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let args: ObjectIdParams = parse_params(method, params)?;
        if !matches!(
            ObjectId::parse(&args.object_id),
            Some(ObjectId::CallFunctionResult(_))
        ) {
            return Ok(false);
        }

        let result = sandbox::send(
            relay,
            &id.session,
            SandboxCommand::ReleaseObject(&args.object_id),
        )
        .await?;
        relay.send_response(
            id,
            if result.is_err() {
                result
            } else {
                CommandResult::empty()
            },
        );
        Ok(true)
    }

    pub(super) async fn call_function_on(
        &self,
        relay: &Relay,
        id: &MessageId,
        method: &str,
        params: &Value,
    ) -> Result<bool> {
        let args: ObjectIdParams = parse_params(method, params)?;
        match ObjectId::parse(&args.object_id) {
            None => Ok(false),
            Some(ObjectId::Scope(_)) => Err(Error::InvalidArguments(format!(
                "{} is not supported on scope {}",
                method, args.object_id
            ))),
            Some(_) => {
                let result =
                    sandbox::send(relay, &id.session, SandboxCommand::CallFunctionOn(params)).await?;
                let result = match result.runtime_value() {
                    Some(value @ Value::Object(_)) => {
                        CommandResult::Ok(json!({ "result": value }))
                    }
                    _ => result,
                };
                relay.send_response(id, result);
                Ok(true)
            }
        }
    }
}
