//! Command dispatch engine.
//!
//! Modules contribute [`CommandSpec`]s, each naming a command key, its
//! parameters and an invoker closure. The [`CommandDispatcher`] keeps every
//! key in one shared, prefix-free namespace and routes raw operator input:
//!
//! 1. Tokenize (double quotes group words, `\"` escapes a quote)
//! 2. Built-ins (`module_help`, `module_reload`) win over module commands
//! 3. Longest-prefix resolution of the multi-word key
//! 4. Argument count check and per-parameter coercion
//! 5. Defaults for omitted trailing optional parameters
//! 6. Invocation
//!
//! The engine knows nothing about how modules are compiled or loaded.

mod coerce;
mod help;
mod tokenizer;

pub use coerce::{coerce, ArgValue, ParamKind, ParamSpec};
pub use help::{BUILTIN_COMMANDS, HELP_COMMAND, HELP_PAGE_SIZE, RELOAD_COMMAND};
pub use tokenizer::tokenize;

use crate::error::CommandError;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info};

/// Invokes a handler with fully coerced arguments, one slot per parameter.
pub type CommandInvoker = Rc<dyn Fn(&[Option<ArgValue>]) -> Result<Option<String>, CommandError>>;

/// Identifies the method behind a command; equal ids denote the same handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId {
    pub owner: String,
    pub method: String,
}

impl HandlerId {
    pub fn new(owner: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            method: method.into(),
        }
    }
}

/// A command as contributed by a module.
#[derive(Clone)]
pub struct CommandSpec {
    pub name: String,
    pub description: Option<String>,
    pub params: Vec<ParamSpec>,
    pub handler: HandlerId,
    pub invoker: CommandInvoker,
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("params", &self.params)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

impl CommandSpec {
    /// Number of arguments the operator must supply.
    pub fn required_args(&self) -> usize {
        self.params.iter().filter(|param| !param.optional).count()
    }
}

/// A registered command key and the module that owns it.
#[derive(Debug, Clone)]
pub(crate) struct CommandBinding {
    pub(crate) owner: String,
    pub(crate) spec: CommandSpec,
}

/// Result of a dispatch that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Output of a built-in help command.
    Help(Vec<String>),
    /// The operator asked for a hot reload; the host performs it.
    ReloadRequested,
    /// A module command ran; `reply` is its textual output, if any.
    Invoked { key: String, reply: Option<String> },
    /// Nothing matched. Not an error.
    NoMatch,
}

/// Normalizes a declared command name into its key.
pub fn command_key(name: &str) -> String {
    name.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The shared command namespace.
#[derive(Debug, Default)]
pub struct CommandDispatcher {
    bindings: BTreeMap<String, CommandBinding>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every command of `owner`.
    ///
    /// The whole batch is checked before anything is inserted, so a conflict
    /// leaves the namespace untouched. Re-registering a key with the same
    /// handler is a no-op. Returns the number of newly bound keys.
    pub fn register_commands(
        &mut self,
        owner: &str,
        specs: Vec<CommandSpec>,
    ) -> Result<usize, CommandError> {
        let mut staged: BTreeMap<String, CommandSpec> = BTreeMap::new();

        for spec in specs {
            let key = command_key(&spec.name);
            if key.is_empty() {
                return Err(CommandError::Conflict {
                    key,
                    existing: String::new(),
                    reason: format!("{} declares a command with an empty name", owner),
                });
            }
            if let Some(builtin) = help::is_reserved(&key) {
                return Err(CommandError::Conflict {
                    key,
                    existing: builtin.to_string(),
                    reason: "reserved by a built-in command".to_string(),
                });
            }

            let existing = self
                .bindings
                .iter()
                .map(|(k, binding)| (k, &binding.spec.handler))
                .chain(staged.iter().map(|(k, spec)| (k, &spec.handler)));
            if check_namespace(&key, &spec.handler, existing)? {
                staged.insert(key, spec);
            } else {
                debug!("Command '{}' already bound to the same handler", key);
            }
        }

        let added = staged.len();
        for (key, spec) in staged {
            debug!("Registered command '{}' for {}", key, owner);
            self.bindings.insert(
                key,
                CommandBinding {
                    owner: owner.to_string(),
                    spec,
                },
            );
        }

        if added > 0 {
            info!("Module {} registered {} commands", owner, added);
        }
        Ok(added)
    }

    /// Removes every binding owned by `owner`; returns how many were removed.
    pub fn unregister_commands(&mut self, owner: &str) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, binding| binding.owner != owner);
        let removed = before - self.bindings.len();
        if removed > 0 {
            debug!("Unregistered {} commands of {}", removed, owner);
        }
        removed
    }

    /// Parses and runs one line of operator input.
    pub fn dispatch(&self, raw_input: &str) -> Result<Dispatched, CommandError> {
        let tokens = tokenize(raw_input);
        let Some(first) = tokens.first() else {
            return Ok(Dispatched::NoMatch);
        };

        match first.to_lowercase().as_str() {
            HELP_COMMAND => return Ok(self.help(&tokens[1..])),
            RELOAD_COMMAND => return Ok(Dispatched::ReloadRequested),
            _ => {}
        }

        let Some((key, consumed)) = resolve(&self.bindings, &tokens) else {
            debug!("No command matches '{}'", raw_input.trim());
            return Ok(Dispatched::NoMatch);
        };
        let binding = &self.bindings[&key];
        let args = assemble_arguments(&key, &binding.spec, &tokens[consumed..])?;

        let reply = (binding.spec.invoker)(&args)?;
        Ok(Dispatched::Invoked { key, reply })
    }

    pub fn get(&self, key: &str) -> Option<&CommandSpec> {
        self.bindings.get(&command_key(key)).map(|binding| &binding.spec)
    }

    /// Registered keys in lexical order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn owner_of(&self, key: &str) -> Option<&str> {
        self.bindings
            .get(&command_key(key))
            .map(|binding| binding.owner.as_str())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn help(&self, args: &[String]) -> Dispatched {
        if args.is_empty() {
            return Dispatched::Help(help::help_page(&self.bindings, 1));
        }
        if let [page] = args {
            if let Ok(page) = page.parse::<usize>() {
                return Dispatched::Help(help::help_page(&self.bindings, page));
            }
        }

        let key = command_key(&args.join(" "));
        match self.bindings.get(&key) {
            Some(binding) => Dispatched::Help(help::command_usage(&key, &binding.spec)),
            None => Dispatched::Help(vec![format!(
                "Unknown command '{}'. Type '{}' to list commands.",
                key, HELP_COMMAND
            )]),
        }
    }
}

/// Checks `key` against the namespace. Returns `Ok(false)` when the key is
/// already bound to `handler`.
fn check_namespace<'a>(
    key: &str,
    handler: &HandlerId,
    existing: impl Iterator<Item = (&'a String, &'a HandlerId)>,
) -> Result<bool, CommandError> {
    let key_prefix = format!("{} ", key);
    for (other, other_handler) in existing {
        if other == key {
            if other_handler == handler {
                return Ok(false);
            }
            return Err(CommandError::Conflict {
                key: key.to_string(),
                existing: other.clone(),
                reason: format!(
                    "already bound to {}::{}",
                    other_handler.owner, other_handler.method
                ),
            });
        }
        if other.starts_with(&key_prefix) {
            return Err(CommandError::Conflict {
                key: key.to_string(),
                existing: other.clone(),
                reason: "prefix of an existing command".to_string(),
            });
        }
        if key.starts_with(&format!("{} ", other)) {
            return Err(CommandError::Conflict {
                key: key.to_string(),
                existing: other.clone(),
                reason: "extends an existing command".to_string(),
            });
        }
    }
    Ok(true)
}

/// Grows the candidate key one token at a time, keeping the longest
/// registered match, until no registered key extends the candidate.
fn resolve<V>(bindings: &BTreeMap<String, V>, tokens: &[String]) -> Option<(String, usize)> {
    let mut candidate = String::new();
    let mut best = None;

    for (index, token) in tokens.iter().enumerate() {
        if index > 0 {
            candidate.push(' ');
        }
        candidate.push_str(&token.to_lowercase());

        if bindings.contains_key(&candidate) {
            best = Some((candidate.clone(), index + 1));
        }

        let extension = format!("{} ", candidate);
        let extended = bindings
            .range(extension.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&extension));
        if !extended {
            break;
        }
    }

    best
}

fn assemble_arguments(
    key: &str,
    spec: &CommandSpec,
    raw: &[String],
) -> Result<Vec<Option<ArgValue>>, CommandError> {
    let min = spec.required_args();
    let max = spec.params.len();
    if raw.len() < min || raw.len() > max {
        return Err(CommandError::ArgumentRange {
            key: key.to_string(),
            min,
            max,
            given: raw.len(),
        });
    }

    spec.params
        .iter()
        .enumerate()
        .map(|(index, param)| match raw.get(index) {
            Some(value) => coerce(value, param).map(Some),
            None => param.default_value(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    type Calls = Rc<RefCell<Vec<Vec<Option<ArgValue>>>>>;

    fn recording(owner: &str, name: &str, method: &str, params: Vec<ParamSpec>) -> (CommandSpec, Calls) {
        let calls: Calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        let spec = CommandSpec {
            name: name.to_string(),
            description: Some(format!("{} command", name)),
            params,
            handler: HandlerId::new(owner, method),
            invoker: Rc::new(move |args: &[Option<ArgValue>]| {
                sink.borrow_mut().push(args.to_vec());
                Ok(Some("done".to_string()))
            }),
        };
        (spec, calls)
    }

    fn text(name: &str) -> ParamSpec {
        ParamSpec::required(name, ParamKind::Text)
    }

    fn rank() -> ParamKind {
        ParamKind::Enum {
            type_name: "Rank".to_string(),
            members: vec!["Guest".to_string(), "Admin".to_string()],
        }
    }

    #[test]
    fn test_register_same_handler_twice_is_noop() {
        let mut dispatcher = CommandDispatcher::new();
        let (spec, _) = recording("Greeter", "Greet", "greet", vec![]);

        assert_eq!(dispatcher.register_commands("Greeter", vec![spec.clone()]).unwrap(), 1);
        assert_eq!(dispatcher.register_commands("Greeter", vec![spec]).unwrap(), 0);
        assert_eq!(dispatcher.len(), 1);
        assert!(dispatcher.get("greet").is_some());
    }

    #[test]
    fn test_register_different_handler_conflicts() {
        let mut dispatcher = CommandDispatcher::new();
        let (first, _) = recording("Greeter", "greet", "greet", vec![]);
        let (second, _) = recording("Welcome", "GREET", "hello", vec![]);

        dispatcher.register_commands("Greeter", vec![first]).unwrap();
        let error = dispatcher.register_commands("Welcome", vec![second]).unwrap_err();
        assert!(matches!(error, CommandError::Conflict { ref key, .. } if key == "greet"));
        assert_eq!(dispatcher.owner_of("greet"), Some("Greeter"));
    }

    #[test]
    fn test_prefix_conflicts_in_both_orders() {
        let mut dispatcher = CommandDispatcher::new();
        let (long, _) = recording("Perms", "perm add", "add", vec![]);
        let (short, _) = recording("Other", "perm", "perm", vec![]);
        dispatcher.register_commands("Perms", vec![long]).unwrap();
        assert!(matches!(
            dispatcher.register_commands("Other", vec![short]),
            Err(CommandError::Conflict { .. })
        ));

        let mut dispatcher = CommandDispatcher::new();
        let (short, _) = recording("Other", "x", "x", vec![]);
        let (long, _) = recording("Perms", "x y", "xy", vec![]);
        dispatcher.register_commands("Other", vec![short]).unwrap();
        assert!(matches!(
            dispatcher.register_commands("Perms", vec![long]),
            Err(CommandError::Conflict { .. })
        ));
    }

    #[test]
    fn test_conflicting_batch_registers_nothing() {
        let mut dispatcher = CommandDispatcher::new();
        let (ok, _) = recording("Perms", "perm add", "add", vec![]);
        let (bad, _) = recording("Perms", "perm", "perm", vec![]);

        assert!(dispatcher.register_commands("Perms", vec![ok, bad]).is_err());
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_builtin_names_are_reserved() {
        let mut dispatcher = CommandDispatcher::new();
        let (spec, _) = recording("Sneaky", "Module_Help", "help", vec![]);
        let error = dispatcher.register_commands("Sneaky", vec![spec]).unwrap_err();
        assert!(matches!(error, CommandError::Conflict { ref existing, .. } if existing == HELP_COMMAND));
    }

    #[test]
    fn test_keys_are_trimmed_and_lowercased() {
        let mut dispatcher = CommandDispatcher::new();
        let (spec, _) = recording("Perms", "  Perm   ADD ", "add", vec![]);
        dispatcher.register_commands("Perms", vec![spec]).unwrap();
        assert_eq!(dispatcher.keys().collect::<Vec<_>>(), vec!["perm add"]);
    }

    #[test]
    fn test_quoted_arguments_reach_handler() {
        let mut dispatcher = CommandDispatcher::new();
        let (spec, calls) = recording("Chat", "cmd", "cmd", vec![text("first"), text("second")]);
        dispatcher.register_commands("Chat", vec![spec]).unwrap();

        let result = dispatcher.dispatch(r#"cmd "a b" c"#).unwrap();
        assert_eq!(
            result,
            Dispatched::Invoked {
                key: "cmd".to_string(),
                reply: Some("done".to_string())
            }
        );
        assert_eq!(
            calls.borrow()[0],
            vec![
                Some(ArgValue::Text("a b".to_string())),
                Some(ArgValue::Text("c".to_string()))
            ]
        );
    }

    #[test]
    fn test_resolution_prefers_longest_registered_key() {
        let mut table: BTreeMap<String, ()> = BTreeMap::new();
        table.insert("perm".to_string(), ());
        table.insert("perm add".to_string(), ());

        let tokens = tokenize("perm add bob");
        assert_eq!(resolve(&table, &tokens), Some(("perm add".to_string(), 2)));

        let tokens = tokenize("perm list");
        assert_eq!(resolve(&table, &tokens), Some(("perm".to_string(), 1)));

        let tokens = tokenize("permission");
        assert_eq!(resolve(&table, &tokens), None);
    }

    #[test]
    fn test_dispatch_runs_longest_registered_key() {
        // Registration never lets these two coexist; seed the table directly.
        let mut dispatcher = CommandDispatcher::new();
        let (perm, perm_calls) = recording("Perms", "perm", "perm", vec![text("action")]);
        let (add, add_calls) = recording("Perms", "perm add", "add", vec![text("user")]);
        for spec in [perm, add] {
            dispatcher.bindings.insert(
                command_key(&spec.name),
                CommandBinding {
                    owner: "Perms".to_string(),
                    spec,
                },
            );
        }

        let result = dispatcher.dispatch("perm add bob").unwrap();
        assert!(matches!(result, Dispatched::Invoked { ref key, .. } if key == "perm add"));
        assert_eq!(add_calls.borrow()[0], vec![Some(ArgValue::Text("bob".to_string()))]);

        let result = dispatcher.dispatch("perm list").unwrap();
        assert!(matches!(result, Dispatched::Invoked { ref key, .. } if key == "perm"));
        assert_eq!(perm_calls.borrow()[0], vec![Some(ArgValue::Text("list".to_string()))]);
        assert_eq!(add_calls.borrow().len(), 1);
    }

    #[test]
    fn test_subcommand_dispatch_and_case_insensitive_key() {
        let mut dispatcher = CommandDispatcher::new();
        let (spec, calls) = recording("Perms", "perm add", "add", vec![text("user")]);
        dispatcher.register_commands("Perms", vec![spec]).unwrap();

        let result = dispatcher.dispatch("PERM Add Bob").unwrap();
        assert!(matches!(result, Dispatched::Invoked { ref key, .. } if key == "perm add"));
        assert_eq!(calls.borrow()[0], vec![Some(ArgValue::Text("Bob".to_string()))]);

        assert_eq!(dispatcher.dispatch("perm list").unwrap(), Dispatched::NoMatch);
        assert_eq!(dispatcher.dispatch("").unwrap(), Dispatched::NoMatch);
    }

    #[test]
    fn test_argument_count_out_of_range() {
        let mut dispatcher = CommandDispatcher::new();
        let (spec, calls) = recording(
            "Perms",
            "grant",
            "grant",
            vec![text("user"), ParamSpec::optional("rank", rank())],
        );
        dispatcher.register_commands("Perms", vec![spec]).unwrap();

        let error = dispatcher.dispatch("grant").unwrap_err();
        assert_eq!(
            error,
            CommandError::ArgumentRange {
                key: "grant".to_string(),
                min: 1,
                max: 2,
                given: 0
            }
        );
        assert!(dispatcher.dispatch("grant a admin extra").is_err());
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn test_enum_argument_coercion() {
        let mut dispatcher = CommandDispatcher::new();
        let (spec, calls) = recording(
            "Perms",
            "grant",
            "grant",
            vec![text("user"), ParamSpec::required("rank", rank())],
        );
        dispatcher.register_commands("Perms", vec![spec]).unwrap();

        dispatcher.dispatch("grant bob aDmIn").unwrap();
        assert_eq!(
            calls.borrow()[0][1],
            Some(ArgValue::Enum {
                type_name: "Rank".to_string(),
                member: "Admin".to_string()
            })
        );

        let error = dispatcher.dispatch("grant bob owner").unwrap_err();
        assert_eq!(
            error,
            CommandError::ArgumentConversion {
                value: "owner".to_string(),
                target: "Rank".to_string()
            }
        );
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn test_missing_optional_arguments_get_defaults() {
        let mut dispatcher = CommandDispatcher::new();
        let (spec, calls) = recording(
            "Broadcast",
            "say",
            "say",
            vec![
                text("message"),
                ParamSpec::required("times", ParamKind::Integer { signed: true, bits: 32 })
                    .with_default("2"),
                ParamSpec::optional("rank", rank()),
            ],
        );
        dispatcher.register_commands("Broadcast", vec![spec]).unwrap();

        dispatcher.dispatch("say hi").unwrap();
        assert_eq!(
            calls.borrow()[0],
            vec![Some(ArgValue::Text("hi".to_string())), Some(ArgValue::Integer(2)), None]
        );
    }

    #[test]
    fn test_handler_errors_do_not_poison_dispatcher() {
        let mut dispatcher = CommandDispatcher::new();
        let failing = CommandSpec {
            name: "explode".to_string(),
            description: None,
            params: vec![],
            handler: HandlerId::new("Boom", "explode"),
            invoker: Rc::new(|_: &[Option<ArgValue>]| {
                Err(CommandError::Handler {
                    key: "explode".to_string(),
                    message: "kaboom".to_string(),
                })
            }),
        };
        let (fine, calls) = recording("Boom", "fine", "fine", vec![]);
        dispatcher.register_commands("Boom", vec![failing, fine]).unwrap();

        assert!(dispatcher.dispatch("explode").is_err());
        assert!(dispatcher.dispatch("fine").is_ok());
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn test_unregister_removes_only_owner_bindings() {
        let mut dispatcher = CommandDispatcher::new();
        let (a, _) = recording("A", "alpha", "alpha", vec![]);
        let (b, _) = recording("B", "beta", "beta", vec![]);
        dispatcher.register_commands("A", vec![a]).unwrap();
        dispatcher.register_commands("B", vec![b]).unwrap();

        assert_eq!(dispatcher.unregister_commands("A"), 1);
        assert_eq!(dispatcher.keys().collect::<Vec<_>>(), vec!["beta"]);
        assert_eq!(dispatcher.unregister_commands("A"), 0);
    }

    #[test]
    fn test_builtins_take_precedence() {
        let dispatcher = CommandDispatcher::new();
        assert_eq!(dispatcher.dispatch("module_reload").unwrap(), Dispatched::ReloadRequested);
        assert_eq!(
            dispatcher.dispatch("MODULE_HELP").unwrap(),
            Dispatched::Help(vec!["No module commands are registered.".to_string()])
        );
    }

    #[test]
    fn test_help_pages_and_command_usage() {
        let mut dispatcher = CommandDispatcher::new();
        let specs = (0..12)
            .map(|i| recording("Bulk", &format!("cmd{:02}", i), &format!("m{}", i), vec![]).0)
            .collect();
        dispatcher.register_commands("Bulk", specs).unwrap();
        let (grant, _) = recording(
            "Perms",
            "grant",
            "grant",
            vec![text("user"), ParamSpec::optional("rank", rank())],
        );
        dispatcher.register_commands("Perms", vec![grant]).unwrap();

        let Dispatched::Help(first) = dispatcher.dispatch("module_help").unwrap() else {
            panic!("expected help output");
        };
        assert_eq!(first[0], "Module commands (page 1/2):");
        assert_eq!(first.len(), 1 + HELP_PAGE_SIZE + 1);
        assert_eq!(first.last().unwrap(), "Type 'module_help 2' for more.");

        let Dispatched::Help(second) = dispatcher.dispatch("module_help 2").unwrap() else {
            panic!("expected help output");
        };
        assert_eq!(second.len(), 1 + 3);
        assert!(second[3].starts_with("  grant"));

        let Dispatched::Help(usage) = dispatcher.dispatch("module_help grant").unwrap() else {
            panic!("expected help output");
        };
        assert_eq!(usage[0], "Usage: grant <user> [rank]");
        assert!(usage.contains(&"  rank: Rank (optional)".to_string()));

        let Dispatched::Help(missing) = dispatcher.dispatch("module_help 9").unwrap() else {
            panic!("expected help output");
        };
        assert!(missing[0].contains("does not exist"));
    }
}
