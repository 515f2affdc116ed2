//! Statement-to-subscription binding.
//!
//! Binding sets the statement's registration-handle attribute. Executing the
//! bound statement is what makes the server start watching the objects the
//! query touches; the result set does not need to be fetched.

use crate::error::{NotifyError, Result};
use crate::native::{check, AttrValue, Attribute, HandleKind, RawHandle};
use tracing::debug;

use super::registry::{SubscriptionRegistry, Tables};
use super::types::RegistrationHandle;

impl SubscriptionRegistry {
    /// Associate a prepared statement with a subscription.
    ///
    /// Fails before touching the statement if the handle is stale or the
    /// statement already belongs to, or is being bound to, another
    /// subscription. Binding the same statement to the same subscription
    /// again is a no-op. A failed bind leaves the statement unbound.
    pub fn bind_statement(&self, handle: &RegistrationHandle, statement: RawHandle) -> Result<()> {
        let err = {
            let mut tables = self.tables.write();
            let err = tables.active(handle)?.connection.error;
            match tables.statements.get(&statement) {
                Some(bound) if *bound == handle.id => return Ok(()),
                Some(bound) => {
                    return Err(NotifyError::AlreadyBound {
                        statement: statement.0,
                        bound_to: *bound,
                    })
                }
                None => {}
            }
            if let Some(owner) = tables.binding.get(&statement) {
                return Err(NotifyError::AlreadyBound {
                    statement: statement.0,
                    bound_to: *owner,
                });
            }
            tables.binding.insert(statement, handle.id);
            err
        };

        let result = self.set_attr(
            statement,
            HandleKind::Statement,
            Attribute::ChnfRegHandle,
            AttrValue::Handle(handle.raw),
            err,
        );

        let mut tables = self.tables.write();
        let Tables {
            entries,
            statements,
            binding,
            ..
        } = &mut *tables;
        binding.remove(&statement);
        result?;
        match entries.get_mut(&handle.id) {
            Some(entry) if entry.generation == handle.generation => {
                entry.statements.push(statement);
                statements.insert(statement, handle.id);
            }
            // Unregistered while the attribute was being set.
            _ => return Err(NotifyError::StaleHandle(handle.id)),
        }
        debug!(subscription = %handle.id, statement = ?statement, "statement bound");
        Ok(())
    }

    /// Bind a statement and execute it, completing the server-side object
    /// registration.
    pub fn register_query(&self, handle: &RegistrationHandle, statement: RawHandle) -> Result<()> {
        self.bind_statement(handle, statement)?;
        let connection = self.tables.read().active(handle)?.connection;
        let client = self.client().as_ref();
        let status = client.stmt_execute(connection.service, statement, connection.error, 0);
        check(client, connection.error, status, "statement execute")?;
        debug!(subscription = %handle.id, statement = ?statement, "query registered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SubscriptionOptions;
    use crate::dispatch::{handler_fn, HandlerResult, NotificationHandler};
    use crate::error::NotifyError;
    use crate::native::{Attribute, ConnectionContext, NotifyCallback, RawHandle, Status};
    use crate::sim::{FaultPoint, SimulatedClient};
    use crate::subscriptions::{RegistrationHandle, SubscriptionRegistry};
    use crate::types::{NotificationEvent, SubscriptionId};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn setup() -> (Arc<SimulatedClient>, SubscriptionRegistry, ConnectionContext) {
        let sim = Arc::new(SimulatedClient::new());
        let ctx = sim.connect();
        (sim.clone(), SubscriptionRegistry::new(sim), ctx)
    }

    fn register(registry: &SubscriptionRegistry, ctx: &ConnectionContext, id: u64) -> RegistrationHandle {
        let handler: Arc<dyn NotificationHandler> = Arc::new(handler_fn(
            |_: SubscriptionId, _: &NotificationEvent| -> HandlerResult { Ok(()) },
        ));
        let callback: NotifyCallback = Arc::new(|_: u64, _: RawHandle| {});
        registry
            .register(ctx, SubscriptionId(id), &SubscriptionOptions::default(), handler, callback)
            .unwrap()
    }

    #[test]
    fn test_bind_sets_reghandle() {
        let (sim, registry, ctx) = setup();
        let handle = register(&registry, &ctx, 1);
        let stmt = sim.prepare(&ctx, "SELECT manager_id FROM employees WHERE employee_id = 206");

        registry.bind_statement(&handle, stmt).unwrap();
        let bound = sim.attr(stmt, Attribute::ChnfRegHandle).unwrap();
        assert_eq!(bound.as_handle(), Some(handle.raw()));
        assert_eq!(sim.executions(stmt), 0);
        assert_eq!(registry.info(handle.id()).unwrap().statements, 1);
    }

    #[test]
    fn test_rebind_same_subscription_is_noop() {
        let (sim, registry, ctx) = setup();
        let handle = register(&registry, &ctx, 1);
        let stmt = sim.prepare(&ctx, "SELECT 1 FROM departments");
        registry.bind_statement(&handle, stmt).unwrap();
        registry.bind_statement(&handle, stmt).unwrap();
        assert_eq!(registry.info(handle.id()).unwrap().statements, 1);
    }

    #[test]
    fn test_bind_to_second_subscription_rejected() {
        let (sim, registry, ctx) = setup();
        let first = register(&registry, &ctx, 1);
        let second = register(&registry, &ctx, 2);
        let stmt = sim.prepare(&ctx, "SELECT 1 FROM departments");
        registry.bind_statement(&first, stmt).unwrap();

        let result = registry.bind_statement(&second, stmt);
        match result {
            Err(NotifyError::AlreadyBound { bound_to, .. }) => assert_eq!(bound_to, SubscriptionId(1)),
            other => panic!("Expected AlreadyBound, got {:?}", other),
        }
        assert_eq!(
            sim.attr(stmt, Attribute::ChnfRegHandle).unwrap().as_handle(),
            Some(first.raw())
        );
    }

    #[test]
    fn test_failed_bind_leaves_statement_unbound() {
        let (sim, registry, ctx) = setup();
        let handle = register(&registry, &ctx, 1);
        let stmt = sim.prepare(&ctx, "SELECT 1 FROM departments");
        sim.inject(FaultPoint::AttrSet(Attribute::ChnfRegHandle), Status::Error);

        assert!(registry.bind_statement(&handle, stmt).is_err());
        assert!(sim.attr(stmt, Attribute::ChnfRegHandle).is_none());
        assert_eq!(registry.info(handle.id()).unwrap().statements, 0);

        // Retry succeeds once the fault clears.
        sim.clear_faults();
        registry.bind_statement(&handle, stmt).unwrap();
    }

    #[test]
    fn test_bind_after_unregister_is_stale() {
        let (sim, registry, ctx) = setup();
        let handle = register(&registry, &ctx, 1);
        registry.unregister(&handle).unwrap();
        let stmt = sim.prepare(&ctx, "SELECT 1 FROM departments");
        assert!(matches!(
            registry.bind_statement(&handle, stmt),
            Err(NotifyError::StaleHandle(_))
        ));
    }

    #[test]
    fn test_register_query_executes() {
        let (sim, registry, ctx) = setup();
        let handle = register(&registry, &ctx, 1);
        let first = sim.prepare(&ctx, "SELECT manager_id FROM employees WHERE employee_id = 206");
        let second = sim.prepare(&ctx, "SELECT department_id FROM departments WHERE department_name = 'Payroll'");

        registry.register_query(&handle, first).unwrap();
        registry.register_query(&handle, second).unwrap();
        assert_eq!(sim.executions(first), 1);
        assert_eq!(sim.executions(second), 1);
        assert!(sim.sql(second).unwrap().contains("departments"));
        assert_eq!(registry.info(handle.id()).unwrap().statements, 2);
    }

    #[test]
    fn test_unregister_frees_statement_binding() {
        let (sim, registry, ctx) = setup();
        let first = register(&registry, &ctx, 1);
        let stmt = sim.prepare(&ctx, "SELECT 1 FROM departments");
        registry.bind_statement(&first, stmt).unwrap();
        registry.unregister(&first).unwrap();

        let second = register(&registry, &ctx, 2);
        registry.bind_statement(&second, stmt).unwrap();
    }

    #[test]
    fn test_bind_in_flight_blocks_other_subscription() {
        let (sim, registry, ctx) = setup();
        let registry = Arc::new(registry);
        let first = register(&registry, &ctx, 1);
        let second = register(&registry, &ctx, 2);
        let stmt = sim.prepare(&ctx, "SELECT 1 FROM departments");

        let hold = sim.hold(FaultPoint::AttrSet(Attribute::ChnfRegHandle));
        let binder = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.bind_statement(&first, stmt))
        };
        assert!(hold.wait_entered(Duration::from_secs(5)));

        let result = registry.bind_statement(&second, stmt);
        match result {
            Err(NotifyError::AlreadyBound { bound_to, .. }) => assert_eq!(bound_to, SubscriptionId(1)),
            other => panic!("Expected AlreadyBound, got {:?}", other),
        }
        hold.release();
        binder.join().unwrap().unwrap();

        assert_eq!(registry.info(first.id()).unwrap().statements, 1);
        assert_eq!(registry.info(second.id()).unwrap().statements, 0);
        assert_eq!(
            sim.attr(stmt, Attribute::ChnfRegHandle).unwrap().as_handle(),
            Some(first.raw())
        );
    }

    #[test]
    fn test_bind_in_flight_released_on_failure() {
        let (sim, registry, ctx) = setup();
        let first = register(&registry, &ctx, 1);
        let second = register(&registry, &ctx, 2);
        let stmt = sim.prepare(&ctx, "SELECT 1 FROM departments");
        sim.inject(FaultPoint::AttrSet(Attribute::ChnfRegHandle), Status::Error);
        assert!(registry.bind_statement(&first, stmt).is_err());

        sim.clear_faults();
        registry.bind_statement(&second, stmt).unwrap();
    }

    #[test]
    fn test_unregister_keeps_binding_of_other_subscription() {
        let (sim, registry, ctx) = setup();
        let first = register(&registry, &ctx, 1);
        let second = register(&registry, &ctx, 2);
        let stmt = sim.prepare(&ctx, "SELECT 1 FROM departments");
        registry.bind_statement(&first, stmt).unwrap();
        registry.unregister(&first).unwrap();
        registry.bind_statement(&second, stmt).unwrap();

        let third = register(&registry, &ctx, 3);
        assert!(matches!(
            registry.bind_statement(&third, stmt),
            Err(NotifyError::AlreadyBound { bound_to: SubscriptionId(2), .. })
        ));
    }
}
