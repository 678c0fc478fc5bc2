//! Signals every Tideline server registers.

use serde_json::{json, Value};
use tideline_core::{
    args, everyone, handler_fn, is_staff, ArgumentKind, ArgumentSpec, ConfigurationError,
    SignalRegistry, Target,
};

pub const ECHO: &str = "tideline.echo";
pub const ECHO_REPLY: &str = "tideline.echo.reply";
pub const ANNOUNCE: &str = "tideline.announce";
pub const ANNOUNCEMENT: &str = "tideline.announcement";
pub const WHOAMI: &str = "tideline.whoami";
pub const IDENTITY: &str = "tideline.identity";

pub fn default_registry() -> Result<SignalRegistry, ConfigurationError> {
    let mut registry = SignalRegistry::new();
    register_builtin(&mut registry)?;
    Ok(registry)
}

pub fn register_builtin(registry: &mut SignalRegistry) -> Result<(), ConfigurationError> {
    // Replies to the calling window with the same arguments.
    registry
        .signal(ECHO)
        .allowed(everyone())
        .handler(handler_fn(|call| async move {
            call.dispatcher
                .trigger(&call.context, ECHO_REPLY, &[Target::Window], call.arguments)
                .await?;
            Ok::<(), anyhow::Error>(())
        }))?;

    registry
        .signal(ANNOUNCE)
        .allowed(is_staff())
        .arguments(ArgumentSpec::strict().required("message", ArgumentKind::String))
        .handler(handler_fn(|call| async move {
            let from = call
                .context
                .user()
                .and_then(|user| user.username.clone())
                .map(Value::String)
                .unwrap_or(Value::Null);
            let mut arguments = call.arguments;
            arguments.insert("from".into(), from);
            call.dispatcher
                .trigger(&call.context, ANNOUNCEMENT, &[Target::Broadcast], arguments)
                .await?;
            Ok::<(), anyhow::Error>(())
        }))?;

    registry
        .signal(WHOAMI)
        .allowed(everyone())
        .handler(handler_fn(|call| async move {
            let identity = args(json!({
                "connection_id": call.context.connection_id(),
                "user": call.context.user(),
                "locale": call.context.locale(),
                "topics": call.context.topics(),
            }));
            call.dispatcher
                .trigger(&call.context, IDENTITY, &[Target::Window], identity)
                .await?;
            Ok::<(), anyhow::Error>(())
        }))?;

    Ok(())
}
