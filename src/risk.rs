//! Static "evil method" classification used by precise instrumentation.

use std::collections::{BTreeMap, HashMap};

use bitflags::bitflags;
use rayon::ThreadPool;
use rayon::prelude::*;
use tracing::debug;

use crate::filter::{MethodFilter, MethodRef};
use crate::ir::{Class, Method};
use crate::mapping::IdentityMapper;
use crate::opcodes::MONITORENTER;

bitflags! {
    /// Why a method is considered expensive. Values are part of the evil method report.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub(crate) struct RiskFlags: u32 {
        const NATIVE_INNER = 1;
        const LOCK = 1 << 1;
        const LOCK_INNER = 1 << 2;
        const INTEREST_METHOD = 1 << 3;
        const AIDL = 1 << 4;
        const LARGE_METHOD = 1 << 5;
        const LOOP = 1 << 6;
        const TRACE_METHOD = 1 << 7;
        const ANNOTATION = 1 << 8;
        const TRACE_CLASS = 1 << 9;
    }
}

/// Known expensive framework calls, `owner#name` with original names.
const DEFAULT_ROOT_METHODS: &[&str] = &[
    "android/database/sqlite/SQLiteDatabase#*",
    "android/content/ContentResolver#query",
    "android/content/SharedPreferences$Editor#commit",
    "android/graphics/BitmapFactory#decodeFile",
    "android/graphics/BitmapFactory#decodeResource",
    "android/graphics/BitmapFactory#decodeStream",
    "android/view/LayoutInflater#inflate",
    "java/io/FileInputStream#read",
    "java/io/FileOutputStream#write",
    "java/lang/Object#wait",
    "java/lang/Thread#sleep",
];

const AIDL_INTERFACE: &str = "android/os/IInterface";

/// Switches for the classifier, read from the filter file.
#[derive(Clone, Debug)]
pub(crate) struct RiskConfig {
    pub(crate) trace_synchronize: bool,
    pub(crate) trace_native: bool,
    pub(crate) trace_loop: bool,
    pub(crate) trace_aidl: bool,
    /// Call count from which a method counts as large; 0 disables the check.
    pub(crate) large_method_size: usize,
    pub(crate) default_roots: bool,
    /// Original `(class, method)` pairs from `-traceevilmethodcallee`.
    pub(crate) callees: Vec<(String, String)>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            trace_synchronize: false,
            trace_native: false,
            trace_loop: false,
            trace_aidl: false,
            large_method_size: 0,
            default_roots: true,
            callees: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct EvilMethod {
    /// Internal name as found in the input.
    pub(crate) class_name: String,
    pub(crate) method_name: String,
    pub(crate) descriptor: String,
    pub(crate) access: u16,
    pub(crate) flags: RiskFlags,
}

impl EvilMethod {
    pub(crate) fn method_ref(&self) -> MethodRef {
        (
            self.class_name.clone(),
            self.method_name.clone(),
            self.descriptor.clone(),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum NamePattern {
    Any,
    Name(String),
    Exact { name: String, descriptor: String },
}

impl NamePattern {
    fn parse(pattern: &str) -> NamePattern {
        match pattern.split_once('(') {
            _ if pattern == "*" => NamePattern::Any,
            Some((name, rest)) => NamePattern::Exact {
                name: name.to_string(),
                descriptor: format!("({rest}"),
            },
            None => NamePattern::Name(pattern.to_string()),
        }
    }

    fn matches(&self, name: &str, descriptor: &str) -> bool {
        match self {
            NamePattern::Any => true,
            NamePattern::Name(expected) => expected == name,
            NamePattern::Exact {
                name: expected,
                descriptor: expected_descriptor,
            } => expected == name && expected_descriptor == descriptor,
        }
    }
}

/// Methods that are expensive by themselves. Calling one makes the caller evil.
#[derive(Debug, Default)]
pub(crate) struct RootTable {
    /// Interest patterns keyed by obfuscated internal owner.
    interest: HashMap<String, Vec<NamePattern>>,
    /// Native and binder methods found in the inputs.
    detected: HashMap<MethodRef, RiskFlags>,
}

impl RootTable {
    pub(crate) fn build(classes: &[Class], config: &RiskConfig, mapper: &IdentityMapper) -> RootTable {
        let mut table = RootTable::default();
        if config.default_roots {
            for entry in DEFAULT_ROOT_METHODS {
                if let Some((owner, name)) = entry.split_once('#') {
                    table.add_interest(mapper, owner, name);
                }
            }
        }
        for (owner, name) in &config.callees {
            table.add_interest(mapper, owner, name);
        }
        for class in classes {
            let is_aidl = class.interfaces.iter().any(|name| name == AIDL_INTERFACE);
            for method in &class.methods {
                let flags = if config.trace_aidl && is_aidl {
                    RiskFlags::AIDL
                } else if config.trace_native && method.access.is_native {
                    RiskFlags::NATIVE_INNER
                } else {
                    continue;
                };
                table.detected.insert(
                    (
                        class.name.clone(),
                        method.name.clone(),
                        method.descriptor.clone(),
                    ),
                    flags,
                );
            }
        }
        debug!(
            interest = table.interest.len(),
            detected = table.detected.len(),
            "root evil methods"
        );
        table
    }

    /// Register an original `owner#pattern`, translated to the obfuscated identity.
    fn add_interest(&mut self, mapper: &IdentityMapper, owner: &str, pattern: &str) {
        let owner = owner.replace('/', ".");
        let pattern = match NamePattern::parse(pattern) {
            NamePattern::Name(name) => {
                let (_, obfuscated) = mapper.obfuscated_info_without_desc(&owner, &name);
                NamePattern::Name(obfuscated)
            }
            other => other,
        };
        let obfuscated_owner = mapper.proguard_class_name(&owner, &owner).replace('.', "/");
        self.interest
            .entry(obfuscated_owner)
            .or_default()
            .push(pattern);
    }

    pub(crate) fn lookup(&self, owner: &str, name: &str, descriptor: &str) -> RiskFlags {
        let interesting = self
            .interest
            .get(owner)
            .is_some_and(|patterns| patterns.iter().any(|pattern| pattern.matches(name, descriptor)));
        if interesting {
            return RiskFlags::INTEREST_METHOD;
        }
        self.detected
            .get(&(owner.to_string(), name.to_string(), descriptor.to_string()))
            .copied()
            .unwrap_or_default()
    }
}

/// Flag every method that calls at least one method, looking one call deep into the
/// root table.
pub(crate) fn classify(
    classes: &[Class],
    config: &RiskConfig,
    filter: &MethodFilter<'_>,
    mapper: &IdentityMapper,
    pool: &ThreadPool,
) -> Vec<EvilMethod> {
    let roots = RootTable::build(classes, config, mapper);
    let methods: Vec<(&Class, &Method)> = classes
        .iter()
        .flat_map(|class| class.methods.iter().map(move |method| (class, method)))
        .collect();
    let mut evil: Vec<EvilMethod> = pool.install(|| {
        methods
            .par_iter()
            .filter_map(|(class, method)| {
                let flags = method_risk(class, method, config, filter, mapper, &roots);
                (!flags.is_empty()).then(|| EvilMethod {
                    class_name: class.name.clone(),
                    method_name: method.name.clone(),
                    descriptor: method.descriptor.clone(),
                    access: method.access.flags,
                    flags,
                })
            })
            .collect()
    });
    evil.sort_by(|a, b| {
        (&a.class_name, &a.method_name, &a.descriptor).cmp(&(
            &b.class_name,
            &b.method_name,
            &b.descriptor,
        ))
    });
    evil
}

fn method_risk(
    class: &Class,
    method: &Method,
    config: &RiskConfig,
    filter: &MethodFilter<'_>,
    mapper: &IdentityMapper,
    roots: &RootTable,
) -> RiskFlags {
    if method.calls.is_empty() {
        return RiskFlags::empty();
    }
    let mut flags = RiskFlags::empty();
    let origin = mapper.origin_full_method(&class.name, &method.name, &method.descriptor);
    if filter.is_trace_method(&origin, class) {
        flags |= RiskFlags::TRACE_METHOD;
    }
    if filter.config().is_trace_class(&origin) {
        flags |= RiskFlags::TRACE_CLASS;
    }
    if filter.has_trace_annotation(method) {
        flags |= RiskFlags::ANNOTATION;
    }
    if config.trace_synchronize {
        if method.access.is_synchronized {
            flags |= RiskFlags::LOCK;
        }
        if method
            .instructions
            .iter()
            .any(|instruction| instruction.opcode == MONITORENTER)
        {
            flags |= RiskFlags::LOCK_INNER;
        }
    }
    if config.trace_loop && method.cfg.back_edge_count() > 0 {
        flags |= RiskFlags::LOOP;
    }
    if config.large_method_size > 0 && method.calls.len() >= config.large_method_size {
        flags |= RiskFlags::LARGE_METHOD;
    }
    for call in &method.calls {
        flags |= roots.lookup(&call.owner, &call.name, &call.descriptor);
    }
    flags
}

/// Flagged methods as `-traceclassmethods` blocks, readable as a filter file.
pub(crate) fn render_report(evil: &[EvilMethod], mapper: &IdentityMapper) -> String {
    let mut by_class: BTreeMap<String, Vec<&EvilMethod>> = BTreeMap::new();
    for method in evil {
        let dotted = method.class_name.replace('/', ".");
        by_class
            .entry(mapper.original_class_name(&dotted, &dotted))
            .or_default()
            .push(method);
    }
    let mut out = String::new();
    for (class_name, methods) in by_class {
        out.push_str(&format!("-traceclassmethods {class_name} {{\n"));
        for method in methods {
            let info = mapper.original_method_info(
                &method.class_name,
                &method.method_name,
                &method.descriptor,
            );
            out.push_str(&format!(
                "   {} {} # risk {}\n",
                info.name,
                info.descriptor,
                method.flags.bits()
            ));
        }
        out.push_str("}\n\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterConfig;
    use crate::ir::{CallSite, ControlFlowGraph, EdgeKind, FlowEdge, Instruction, MethodAccess};
    use crate::opcodes::{INVOKESTATIC, RETURN};

    fn calling(name: &str, callees: &[(&str, &str)]) -> Method {
        let calls: Vec<CallSite> = callees
            .iter()
            .map(|(owner, callee)| CallSite {
                owner: owner.to_string(),
                name: callee.to_string(),
                descriptor: "()V".to_string(),
            })
            .collect();
        let mut instructions: Vec<Instruction> = (0..calls.len())
            .map(|index| Instruction {
                offset: index as u32 * 3,
                opcode: INVOKESTATIC,
            })
            .collect();
        instructions.push(Instruction {
            offset: calls.len() as u32 * 3,
            opcode: RETURN,
        });
        Method {
            name: name.to_string(),
            descriptor: "()V".to_string(),
            access: MethodAccess {
                flags: 0x0009,
                ..MethodAccess::default()
            },
            instructions,
            cfg: ControlFlowGraph::default(),
            calls,
            annotations: Vec::new(),
        }
    }

    fn native(name: &str) -> Method {
        let mut method = calling(name, &[]);
        method.instructions.clear();
        method.access.is_native = true;
        method.access.flags |= 0x0100;
        method
    }

    fn class(name: &str, methods: Vec<Method>) -> Class {
        Class {
            name: name.to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            methods,
        }
    }

    fn run(classes: &[Class], filter_text: &str) -> Vec<EvilMethod> {
        let (config, _) = FilterConfig::parse(filter_text);
        let mapper = IdentityMapper::default();
        let filter = MethodFilter::new(&config, &mapper);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .expect("pool");
        classify(classes, &config.risk, &filter, &mapper, &pool)
    }

    #[test]
    fn native_risk_propagates_one_hop_only() {
        let classes = vec![
            class("A", vec![calling("x", &[("B", "y")])]),
            class("B", vec![native("y")]),
            class("Z", vec![calling("w", &[("A", "x")])]),
        ];

        let evil = run(&classes, "-tracenative");

        assert_eq!(1, evil.len());
        assert_eq!(("A", "x"), (evil[0].class_name.as_str(), evil[0].method_name.as_str()));
        assert!(evil[0].flags.contains(RiskFlags::NATIVE_INNER));
    }

    #[test]
    fn native_roots_need_the_switch() {
        let classes = vec![
            class("A", vec![calling("x", &[("B", "y")])]),
            class("B", vec![native("y")]),
        ];

        assert!(run(&classes, "").is_empty());
    }

    #[test]
    fn interest_patterns_and_defaults_match_callees() {
        let classes = vec![class(
            "com/example/Repo",
            vec![
                calling("load", &[("com/example/Db", "query")]),
                calling("sleepy", &[("java/lang/Thread", "sleep")]),
                calling("plain", &[("com/example/Db", "close")]),
            ],
        )];

        let evil = run(&classes, "-traceevilmethodcallee com.example.Db {\n query\n}\n");

        let names: Vec<&str> = evil.iter().map(|method| method.method_name.as_str()).collect();
        assert_eq!(vec!["load", "sleepy"], names);
        assert!(evil.iter().all(|method| method.flags == RiskFlags::INTEREST_METHOD));

        let without_defaults = run(&classes, "-disabledefaultpreciseinstrumentation");
        assert!(without_defaults.is_empty());
    }

    #[test]
    fn structural_signals_follow_switches() {
        let mut looping = calling("spin", &[("C", "tick")]);
        looping.cfg.edges.push(FlowEdge {
            from: 6,
            to: 0,
            kind: EdgeKind::Branch,
        });
        let mut locked = calling("locked", &[("C", "tick")]);
        locked.access.is_synchronized = true;
        let large = calling("large", &[("C", "a"), ("C", "b"), ("C", "c")]);
        let classes = vec![class("C", vec![looping, locked, large])];

        let evil = run(&classes, "-traceloop\n-tracesynchronize\n-tracelargemethod 3\n");

        let flags: Vec<(&str, RiskFlags)> = evil
            .iter()
            .map(|method| (method.method_name.as_str(), method.flags))
            .collect();
        assert_eq!(
            vec![
                ("large", RiskFlags::LARGE_METHOD),
                ("locked", RiskFlags::LOCK),
                ("spin", RiskFlags::LOOP),
            ],
            flags
        );
    }

    #[test]
    fn trace_classes_match_by_prefix() {
        let classes = vec![
            class("com/example/net/Client", vec![calling("send", &[("C", "tick")])]),
            class("com/example/Repo", vec![calling("load", &[("C", "tick")])]),
        ];

        let evil = run(&classes, "-traceclass com.example.net\n");

        assert_eq!(1, evil.len());
        assert_eq!("send", evil[0].method_name);
        assert_eq!(RiskFlags::TRACE_CLASS, evil[0].flags);
    }

    #[test]
    fn aidl_classes_are_roots() {
        let mut stub = class("com/example/IRemote$Stub$Proxy", vec![calling("call", &[])]);
        stub.interfaces.push(AIDL_INTERFACE.to_string());
        let classes = vec![
            stub,
            class(
                "com/example/Client",
                vec![calling("fetch", &[("com/example/IRemote$Stub$Proxy", "call")])],
            ),
        ];

        let evil = run(&classes, "-traceaidl");

        assert_eq!(1, evil.len());
        assert_eq!(RiskFlags::AIDL, evil[0].flags);
    }

    #[test]
    fn report_groups_methods_by_class() {
        let evil = vec![
            EvilMethod {
                class_name: "com/example/Foo".to_string(),
                method_name: "bar".to_string(),
                descriptor: "()V".to_string(),
                access: 1,
                flags: RiskFlags::LOOP | RiskFlags::LOCK,
            },
            EvilMethod {
                class_name: "com/example/Foo".to_string(),
                method_name: "qux".to_string(),
                descriptor: "(I)V".to_string(),
                access: 1,
                flags: RiskFlags::NATIVE_INNER,
            },
        ];

        let report = render_report(&evil, &IdentityMapper::default());

        assert_eq!(
            "-traceclassmethods com.example.Foo {\n   bar ()V # risk 66\n   qux (I)V # risk 1\n}\n\n",
            report
        );
        let (config, errors) = FilterConfig::parse(&report);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(2, config.trace_methods.len());
        assert_eq!("bar", config.trace_methods[0].method);
    }

    #[test]
    fn report_uses_original_descriptors() {
        let (mapper, _) = IdentityMapper::parse(
            "com.example.Bar -> a.b:\ncom.example.Foo -> a.a:\n    void bar(com.example.Bar) -> a\n",
        );
        let evil = vec![EvilMethod {
            class_name: "a/a".to_string(),
            method_name: "a".to_string(),
            descriptor: "(La/b;)V".to_string(),
            access: 1,
            flags: RiskFlags::LOOP,
        }];

        let report = render_report(&evil, &mapper);

        assert_eq!(
            format!(
                "-traceclassmethods com.example.Foo {{\n   bar (Lcom/example/Bar;)V # risk {}\n}}\n\n",
                RiskFlags::LOOP.bits()
            ),
            report
        );
    }
}
