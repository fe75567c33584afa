//! Behavior descriptors
//!
//! Static metadata about a behavior, built once at startup and shared by
//! every worker. A descriptor says how to construct the value, which
//! providers feed each method, which methods run on timers or transport
//! hooks, which children the kite owns and how routing into it works.
//!
//! ```rust
//! use kite_actors::{Descriptor, IntervalSpec, MethodSpec, Provider};
//! use std::time::Duration;
//! # use kite_actors::{Behavior, Invocation};
//! # struct Npc;
//! # #[async_trait::async_trait(?Send)]
//! # impl Behavior for Npc {
//! #     async fn invoke(&self, _: &str, _: Invocation) -> anyhow::Result<serde_json::Value> {
//! #         Ok(serde_json::Value::Null)
//! #     }
//! # }
//!
//! let npc = Descriptor::builder("npc")
//!     .construct([Provider::Id])
//!     .factory(|_| Ok(Npc))
//!     .method(
//!         MethodSpec::new("wander")
//!             .interval(IntervalSpec::every("wander", Duration::from_secs(1))),
//!     )
//!     .build()
//!     .unwrap();
//! assert!(npc.method("wander").is_some());
//! ```

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use kite_types::{Address, KiteId, Target};
use serde_json::{Map, Value};

use crate::behavior::{Behavior, Invocation};
use crate::error::{KiteError, Result};

/// Source of an injected parameter or property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    /// The kite's own address
    Address,
    /// The kite's id, or null
    Id,
    /// The creation options, or one key of them
    Options(Option<String>),
    /// A remote handle sourced at this kite
    Remote,
    /// The value of a named child of the root kite
    Reference(String),
    /// The controller's transport server
    Server,
    /// The connection that raised the current transport event
    Connection,
    /// Argument `index` of the current transport message, or one key of it
    MessageBody { index: usize, key: Option<String> },
    /// A key of the inputs passed down from the parent's template
    Input(String),
}

/// What to do with a method's return value in a transport context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultTag {
    /// Pass it to the client's acknowledgement callback
    Ack,
    /// Treat it as `{event, data}` and emit it on the connection
    Emit,
}

/// Transport event that triggers a method on a controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hook {
    Connection,
    Disconnect,
    Message(String),
}

/// Timer attached to a method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalSpec {
    pub name: String,
    pub delay: Option<Duration>,
    pub repeat: Option<Duration>,
}

impl IntervalSpec {
    /// Fire once after `delay`
    pub fn once(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay: Some(delay),
            repeat: None,
        }
    }

    /// Fire every `period`, first after one period
    pub fn every(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            delay: None,
            repeat: Some(period),
        }
    }

    /// Override the first firing
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delay before the first firing
    pub fn first_delay(&self) -> Duration {
        self.delay.or(self.repeat).unwrap_or(Duration::ZERO)
    }
}

/// Per-method metadata
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub parameters: Vec<Provider>,
    pub results: Vec<ResultTag>,
    pub interval: Option<IntervalSpec>,
    pub hooks: Vec<Hook>,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            results: Vec::new(),
            interval: None,
            hooks: Vec::new(),
        }
    }

    pub fn params(mut self, providers: impl IntoIterator<Item = Provider>) -> Self {
        self.parameters.extend(providers);
        self
    }

    pub fn result(mut self, tag: ResultTag) -> Self {
        self.results.push(tag);
        self
    }

    pub fn interval(mut self, interval: IntervalSpec) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn on_connection(mut self) -> Self {
        self.hooks.push(Hook::Connection);
        self
    }

    pub fn on_disconnect(mut self) -> Self {
        self.hooks.push(Hook::Disconnect);
        self
    }

    pub fn on_message(mut self, event: impl Into<String>) -> Self {
        self.hooks.push(Hook::Message(event.into()));
        self
    }
}

/// One child produced by a template
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSpec {
    pub name: String,
    /// Name the root kite can use to reference this child
    pub reference: Option<String>,
    pub inputs: Map<String, Value>,
    pub options: Value,
}

impl ChildSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reference: None,
            inputs: Map::new(),
            options: Value::Null,
        }
    }

    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

/// What a child template can see of its parent
#[derive(Debug, Clone, Copy)]
pub struct TemplateScope<'a> {
    pub address: Address,
    pub id: Option<&'a KiteId>,
    pub options: &'a Value,
    pub inputs: &'a Map<String, Value>,
}

pub type Factory = Arc<dyn Fn(Invocation) -> anyhow::Result<Rc<dyn Behavior>> + Send + Sync>;
pub type ChildTemplate = Arc<dyn Fn(&TemplateScope<'_>) -> Vec<ChildSpec> + Send + Sync>;
pub type RouteFn = Arc<dyn Fn(&[Value]) -> Result<Target> + Send + Sync>;
pub type ActionFn = Arc<dyn Fn(&[Value], &str, Vec<Value>) -> (String, Vec<Value>) + Send + Sync>;

/// Named custom routing
pub struct RouterSpec {
    pub name: String,
    /// Maps the route parameters after the name to a target
    pub route: RouteFn,
    /// Rewrites method and args at the receiving worker
    pub action: Option<ActionFn>,
}

impl RouterSpec {
    pub fn new<F>(name: impl Into<String>, route: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Target> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            route: Arc::new(route),
            action: None,
        }
    }

    pub fn action<F>(mut self, action: F) -> Self
    where
        F: Fn(&[Value], &str, Vec<Value>) -> (String, Vec<Value>) + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }
}

impl std::fmt::Debug for RouterSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterSpec")
            .field("name", &self.name)
            .field("action", &self.action.is_some())
            .finish()
    }
}

/// Marks a behavior as a transport controller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerSpec {
    pub default_port: Option<u16>,
}

/// Complete metadata for one behavior
pub struct Descriptor {
    pub name: String,
    pub construction: Vec<Provider>,
    pub methods: HashMap<String, MethodSpec>,
    pub properties: Vec<(String, Vec<Provider>)>,
    pub children: Option<ChildTemplate>,
    pub router: Option<Arc<RouterSpec>>,
    pub controller: Option<ControllerSpec>,
    factory: Factory,
}

impl Descriptor {
    pub fn builder(name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            name: name.into(),
            construction: Vec::new(),
            methods: HashMap::new(),
            properties: Vec::new(),
            children: None,
            router: None,
            controller: None,
            factory: None,
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }

    /// Construct a fresh value
    pub fn instantiate(&self, call: Invocation) -> anyhow::Result<Rc<dyn Behavior>> {
        (self.factory)(call)
    }

    /// Methods that run on a timer
    pub fn intervals(&self) -> impl Iterator<Item = (&str, &IntervalSpec)> + '_ {
        self.methods
            .values()
            .filter_map(|m| m.interval.as_ref().map(|i| (m.name.as_str(), i)))
    }

    /// Methods bound to a transport hook
    pub fn hooked<'a>(&'a self, hook: &'a Hook) -> impl Iterator<Item = &'a MethodSpec> + 'a {
        self.methods.values().filter(move |m| m.hooks.contains(hook))
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("name", &self.name)
            .field("construction", &self.construction)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("children", &self.children.is_some())
            .field("router", &self.router)
            .field("controller", &self.controller)
            .finish()
    }
}

pub struct DescriptorBuilder {
    name: String,
    construction: Vec<Provider>,
    methods: HashMap<String, MethodSpec>,
    properties: Vec<(String, Vec<Provider>)>,
    children: Option<ChildTemplate>,
    router: Option<Arc<RouterSpec>>,
    controller: Option<ControllerSpec>,
    factory: Option<Factory>,
}

impl DescriptorBuilder {
    /// Providers passed to the factory, in order
    pub fn construct(mut self, providers: impl IntoIterator<Item = Provider>) -> Self {
        self.construction.extend(providers);
        self
    }

    pub fn factory<B, F>(mut self, factory: F) -> Self
    where
        B: Behavior + 'static,
        F: Fn(Invocation) -> anyhow::Result<B> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(move |call| {
            factory(call).map(|value| Rc::new(value) as Rc<dyn Behavior>)
        }));
        self
    }

    pub fn method(mut self, spec: MethodSpec) -> Self {
        self.methods.insert(spec.name.clone(), spec);
        self
    }

    pub fn property(mut self, name: impl Into<String>, providers: impl IntoIterator<Item = Provider>) -> Self {
        self.properties
            .push((name.into(), providers.into_iter().collect()));
        self
    }

    pub fn children<F>(mut self, template: F) -> Self
    where
        F: Fn(&TemplateScope<'_>) -> Vec<ChildSpec> + Send + Sync + 'static,
    {
        self.children = Some(Arc::new(template));
        self
    }

    pub fn router(mut self, router: RouterSpec) -> Self {
        self.router = Some(Arc::new(router));
        self
    }

    pub fn controller(mut self, default_port: Option<u16>) -> Self {
        self.controller = Some(ControllerSpec { default_port });
        self
    }

    pub fn build(self) -> Result<Descriptor> {
        let factory = self
            .factory
            .ok_or_else(|| KiteError::boot(format!("behavior {} has no factory", self.name)))?;

        for spec in self.methods.values() {
            if let Some(interval) = &spec.interval {
                if interval.repeat == Some(Duration::ZERO) {
                    return Err(KiteError::boot(format!(
                        "timer {} of {} repeats with a zero period",
                        interval.name, self.name
                    )));
                }
            }
        }

        Ok(Descriptor {
            name: self.name,
            construction: self.construction,
            methods: self.methods,
            properties: self.properties,
            children: self.children,
            router: self.router,
            controller: self.controller,
            factory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Idle;

    #[async_trait(?Send)]
    impl Behavior for Idle {
        async fn invoke(&self, _method: &str, _call: Invocation) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_interval_first_delay() {
        let repeat = IntervalSpec::every("tick", Duration::from_secs(2));
        assert_eq!(repeat.first_delay(), Duration::from_secs(2));
        assert_eq!(
            repeat.after(Duration::from_millis(5)).first_delay(),
            Duration::from_millis(5)
        );

        let once = IntervalSpec {
            name: "boot".into(),
            delay: None,
            repeat: None,
        };
        assert_eq!(once.first_delay(), Duration::ZERO);
    }

    #[test]
    fn test_build_requires_factory() {
        let err = Descriptor::builder("ghost").build().unwrap_err();
        assert_eq!(err.category(), "boot");
    }

    #[test]
    fn test_zero_period_rejected() {
        let err = Descriptor::builder("spin")
            .factory(|_| Ok(Idle))
            .method(MethodSpec::new("spin").interval(IntervalSpec::every("spin", Duration::ZERO)))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("zero period"));
    }

    #[test]
    fn test_hooked_methods() {
        let gate = Descriptor::builder("gate")
            .factory(|_| Ok(Idle))
            .method(MethodSpec::new("login").on_message("login").result(ResultTag::Ack))
            .method(MethodSpec::new("hello").on_connection())
            .controller(Some(8080))
            .build()
            .unwrap();

        let login = Hook::Message("login".into());
        let names: Vec<_> = gate.hooked(&login).map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["login"]);
        assert_eq!(gate.hooked(&Hook::Disconnect).count(), 0);
        assert_eq!(gate.controller.as_ref().and_then(|c| c.default_port), Some(8080));
    }
}
