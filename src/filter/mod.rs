//! Per-method instrumentation decisions.

use std::collections::HashSet;

use crate::descriptor::simple_class_name;
use crate::ir::{Class, Method};
use crate::mapping::IdentityMapper;
use crate::opcodes::{self, GETFIELD, GETSTATIC, INVOKESPECIAL, PUTFIELD, PUTSTATIC, SALOAD};

pub(crate) mod config;

pub(crate) use config::FilterConfig;

/// Identity of a method as it appears in bytecode: internal class name, name, descriptor.
pub(crate) type MethodRef = (String, String, String);

/// Decides whether a method is left alone. Holds no state of its own beyond the
/// risk-flagged methods handed over by the classifier.
pub(crate) struct MethodFilter<'a> {
    config: &'a FilterConfig,
    mapper: &'a IdentityMapper,
    flagged: HashSet<MethodRef>,
}

impl<'a> MethodFilter<'a> {
    pub(crate) fn new(config: &'a FilterConfig, mapper: &'a IdentityMapper) -> MethodFilter<'a> {
        MethodFilter {
            config,
            mapper,
            flagged: HashSet::new(),
        }
    }

    /// Force-include methods the risk classifier flagged.
    pub(crate) fn with_flagged(mut self, flagged: impl IntoIterator<Item = MethodRef>) -> Self {
        self.flagged.extend(flagged);
        self
    }

    pub(crate) fn config(&self) -> &FilterConfig {
        self.config
    }

    /// `true` when the method must not be instrumented.
    pub(crate) fn need_filter(&self, method: &Method, class: &Class) -> bool {
        let origin = self
            .mapper
            .origin_full_method(&class.name, &method.name, &method.descriptor);
        if !self.is_allowed(&origin) {
            return true;
        }
        if self.is_blocked(&origin) {
            return true;
        }
        if self.is_forced(&origin, method, class) {
            return false;
        }
        if self.config.precise {
            return true;
        }
        if self.is_generated_class(class) || is_trivial(method) {
            return true;
        }
        self.is_block_method(&origin)
    }

    fn is_allowed(&self, origin: &str) -> bool {
        self.config.allow_packages.is_empty()
            || self
                .config
                .allow_packages
                .iter()
                .any(|package| origin.starts_with(package.as_str()))
    }

    fn is_blocked(&self, origin: &str) -> bool {
        self.config
            .block_packages
            .iter()
            .chain(&self.config.default_block_packages)
            .any(|package| origin.starts_with(package.as_str()))
    }

    fn is_forced(&self, origin: &str, method: &Method, class: &Class) -> bool {
        self.config.is_trace_class(origin)
            || self.is_trace_method(origin, class)
            || self.has_trace_annotation(method)
            || self.flagged.contains(&(
                class.name.clone(),
                method.name.clone(),
                method.descriptor.clone(),
            ))
    }

    /// Match `-traceclassmethods` rules against the de-obfuscated method string.
    pub(crate) fn is_trace_method(&self, origin: &str, class: &Class) -> bool {
        self.config.trace_methods.iter().any(|rule| {
            let call = format!(".{}(", rule.method);
            if rule.class_name.is_empty() {
                let supertypes = class.super_name.iter().chain(&class.interfaces);
                return origin.contains(&call)
                    && supertypes
                        .map(|name| self.original_dotted(name))
                        .any(|name| name == rule.super_name);
            }
            if rule.class_name == "*" {
                return origin.contains(&call);
            }
            if rule.method == "*" {
                return origin.starts_with(&format!("{}.", rule.class_name));
            }
            origin.starts_with(&format!("{}{call}", rule.class_name))
        })
    }

    pub(crate) fn has_trace_annotation(&self, method: &Method) -> bool {
        !self.config.trace_annotations.is_empty()
            && method
                .annotations
                .iter()
                .any(|annotation| self.config.trace_annotations.contains(&self.original_dotted(annotation)))
    }

    fn is_generated_class(&self, class: &Class) -> bool {
        let original = self.original_dotted(&class.name);
        let simple = simple_class_name(&original);
        simple == "R"
            || simple.starts_with("R$")
            || simple == "Manifest"
            || simple.starts_with("Manifest$")
            || simple == "BuildConfig"
    }

    fn is_block_method(&self, origin: &str) -> bool {
        self.config
            .block_methods
            .iter()
            .any(|prefix| origin.starts_with(prefix.as_str()))
    }

    fn original_dotted(&self, internal_name: &str) -> String {
        let dotted = internal_name.replace('/', ".");
        self.mapper.original_class_name(&dotted, &dotted)
    }
}

/// Accessor, at most one call (two for constructors), or nothing at all.
pub(crate) fn is_trivial(method: &Method) -> bool {
    is_accessor(method) || is_single_call(method) || !method.has_body()
}

/// Only loads, constants, field access and returns. A constructor may also call its
/// superclass constructor once.
fn is_accessor(method: &Method) -> bool {
    let mut super_calls = 0;
    for instruction in &method.instructions {
        let opcode = instruction.opcode;
        if opcode <= SALOAD
            || matches!(opcode, GETFIELD | GETSTATIC | PUTFIELD | PUTSTATIC)
            || opcodes::is_return(opcode)
        {
            continue;
        }
        if method.name == "<init>" && opcode == INVOKESPECIAL {
            super_calls += 1;
            if super_calls > 1 {
                return false;
            }
            continue;
        }
        return false;
    }
    true
}

fn is_single_call(method: &Method) -> bool {
    let limit = if method.name == "<init>" { 2 } else { 1 };
    method.call_count() <= limit
}
