use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::error::{ConfigConsistencyError, ParseError};
use crate::risk::RiskConfig;

/// Packages that are never instrumented, in dotted form.
pub(crate) const DEFAULT_BLOCK_PACKAGES: &[&str] = &["android."];

/// `-traceclassmethods` entry. `class_name` is empty when the block names a supertype.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TraceMethodRule {
    pub(crate) class_name: String,
    pub(crate) super_name: String,
    pub(crate) method: String,
}

/// Parsed filter directives. Every name is dotted and de-obfuscated.
#[derive(Clone, Debug, Default)]
pub(crate) struct FilterConfig {
    pub(crate) allow_packages: BTreeSet<String>,
    pub(crate) block_packages: BTreeSet<String>,
    pub(crate) default_block_packages: BTreeSet<String>,
    /// `pkg.Class.method(args)` prefixes.
    pub(crate) block_methods: BTreeSet<String>,
    /// `pkg.Class.method(args)` prefix to the indexes of captured parameters.
    pub(crate) param_methods: BTreeMap<String, Vec<usize>>,
    pub(crate) trace_classes: BTreeSet<String>,
    pub(crate) trace_methods: Vec<TraceMethodRule>,
    pub(crate) trace_annotations: BTreeSet<String>,
    pub(crate) precise: bool,
    pub(crate) risk: RiskConfig,
}

impl FilterConfig {
    /// Read a filter file. Malformed directives are logged and skipped; a missing path
    /// leaves only the default block packages.
    pub(crate) fn load(path: Option<&Path>) -> Result<FilterConfig> {
        let text = match path {
            Some(path) if path.exists() => fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
            Some(path) => {
                warn!(path = %path.display(), "filter file not found, using defaults");
                String::new()
            }
            None => String::new(),
        };
        let (config, errors) = FilterConfig::parse(&text);
        for error in &errors {
            warn!("skipping filter directive: {error}");
        }
        info!(
            allow = ?config.allow_packages,
            block = ?config.block_packages,
            "filter packages"
        );
        Ok(config)
    }

    pub(crate) fn parse(text: &str) -> (FilterConfig, Vec<ParseError>) {
        let mut config = FilterConfig::default();
        config.default_block_packages = DEFAULT_BLOCK_PACKAGES
            .iter()
            .map(|package| package.to_string())
            .collect();
        let mut errors = Vec::new();
        let normalized = text.replace('/', ".");
        let mut lines = normalized
            .lines()
            .enumerate()
            .map(|(index, line)| (index + 1, line.trim()));

        while let Some((number, line)) = lines.next() {
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            let error = |msg: &str| ParseError::Directive {
                line: number,
                msg: msg.to_string(),
                raw: line.to_string(),
            };
            let (directive, argument) = match line.split_once(char::is_whitespace) {
                Some((directive, argument)) => (directive, argument.trim()),
                None => (line, ""),
            };
            match directive {
                "-defaultblockpackage" | "-blockpackage" | "-allowpackage" | "-traceclass"
                | "-tracemethodannotation" => {
                    if argument.is_empty() {
                        errors.push(error("missing name"));
                        continue;
                    }
                    let target = match directive {
                        "-defaultblockpackage" => &mut config.default_block_packages,
                        "-blockpackage" => &mut config.block_packages,
                        "-allowpackage" => &mut config.allow_packages,
                        "-traceclass" => &mut config.trace_classes,
                        _ => &mut config.trace_annotations,
                    };
                    target.insert(argument.to_string());
                }
                "-blockclassmethods" => {
                    let class_name = block_header(argument);
                    for item in block_items(&mut lines) {
                        let method: String = item.split(';').next().unwrap_or_default().replace(' ', "");
                        config.block_methods.insert(format!("{class_name}.{method}"));
                    }
                }
                "-allowclassmethodswithparametervalues" => {
                    let class_name = block_header(argument).to_string();
                    for item in block_items(&mut lines) {
                        let method: String = item.split(';').next().unwrap_or_default().replace(' ', "");
                        match parameter_capture(&class_name, &method) {
                            Some((key, indexes)) => {
                                config.param_methods.insert(key, indexes);
                            }
                            None => errors.push(error("capture method needs an argument list")),
                        }
                    }
                }
                "-traceclassmethods" => {
                    let header: Vec<&str> = block_header(argument).split_whitespace().collect();
                    let rule = match header.as_slice() {
                        [class_name] => Some((class_name.to_string(), String::new())),
                        [_, "implements", super_name] => Some((String::new(), super_name.to_string())),
                        _ => None,
                    };
                    let items = block_items(&mut lines);
                    let Some((class_name, super_name)) = rule else {
                        errors.push(error("expected `<class>` or `<class> implements <type>`"));
                        continue;
                    };
                    for item in items {
                        let method = item
                            .split_whitespace()
                            .next()
                            .unwrap_or_default()
                            .trim_end_matches(';');
                        config.trace_methods.push(TraceMethodRule {
                            class_name: class_name.clone(),
                            super_name: super_name.clone(),
                            method: method.to_string(),
                        });
                    }
                }
                "-traceevilmethodcallee" => {
                    let header: Vec<&str> = block_header(argument).split_whitespace().collect();
                    let items = block_items(&mut lines);
                    let [class_name] = header.as_slice() else {
                        errors.push(error("expected a single class name"));
                        continue;
                    };
                    for item in items {
                        let method = item
                            .split_whitespace()
                            .next()
                            .unwrap_or_default()
                            .trim_end_matches(';');
                        config
                            .risk
                            .callees
                            .push((class_name.to_string(), method.to_string()));
                    }
                }
                "-tracelargemethod" => match argument.parse::<usize>() {
                    Ok(size) => config.risk.large_method_size = size,
                    Err(_) => errors.push(error("expected a call count")),
                },
                "-enablepreciseinstrumentation" => config.precise = true,
                "-tracesynchronize" => config.risk.trace_synchronize = true,
                "-tracenative" => config.risk.trace_native = true,
                "-traceloop" => config.risk.trace_loop = true,
                "-traceaidl" => config.risk.trace_aidl = true,
                "-disabledefaultpreciseinstrumentation" => config.risk.default_roots = false,
                _ => errors.push(error("unknown directive")),
            }
        }
        (config, errors)
    }

    /// Every block package must sit strictly inside some allow package.
    pub(crate) fn check(&self) -> Result<(), ConfigConsistencyError> {
        if self.allow_packages.is_empty() {
            return Ok(());
        }
        for block in &self.block_packages {
            if self.allow_packages.contains(block) {
                return Err(ConfigConsistencyError::BlockEqualsAllow(block.clone()));
            }
            if !self
                .allow_packages
                .iter()
                .any(|allow| block.starts_with(allow.as_str()))
            {
                return Err(ConfigConsistencyError::BlockOutsideAllow {
                    block: block.clone(),
                    allowed: self
                        .allow_packages
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", "),
                });
            }
        }
        Ok(())
    }

    /// Keep the tracing runtime itself out of instrumentation.
    pub(crate) fn block_runtime_class(&mut self, internal_name: &str) {
        if let Some((package, _)) = internal_name.rsplit_once('/') {
            self.default_block_packages
                .insert(format!("{}.", package.replace('/', ".")));
        }
    }

    /// `-traceclass` entries are prefixes of the original class or full method name.
    pub(crate) fn is_trace_class(&self, origin: &str) -> bool {
        self.trace_classes
            .iter()
            .any(|prefix| origin.starts_with(prefix.as_str()))
    }

    /// Indexes of captured parameters when the method is a capture target.
    pub(crate) fn captured_parameters(&self, origin_full_method: &str) -> Option<&[usize]> {
        self.param_methods
            .iter()
            .find(|(prefix, _)| origin_full_method.starts_with(prefix.as_str()))
            .map(|(_, indexes)| indexes.as_slice())
    }
}

fn block_header(argument: &str) -> &str {
    argument.trim_end_matches('{').trim()
}

/// Lines up to the closing brace, skipping blanks and comments.
fn block_items<'a>(lines: &mut impl Iterator<Item = (usize, &'a str)>) -> Vec<&'a str> {
    let mut items = Vec::new();
    for (_, line) in lines.by_ref() {
        if line.starts_with('}') {
            break;
        }
        if line.is_empty() || line.starts_with('#') || line == "{" {
            continue;
        }
        items.push(line);
    }
    items
}

/// `m(*int,java.lang.String)` -> (`Class.m(int,java.lang.String)`, `[0]`).
fn parameter_capture(class_name: &str, method: &str) -> Option<(String, Vec<usize>)> {
    let open = method.find('(')?;
    let close = method.find(')')?;
    if close < open {
        return None;
    }
    let indexes = method[open + 1..close]
        .split(',')
        .enumerate()
        .filter(|(_, param)| param.starts_with('*'))
        .map(|(index, _)| index)
        .collect();
    Some((format!("{class_name}.{method}").replace('*', ""), indexes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "
[package]
-allowpackage com/example/
-blockpackage com.example.internal.
# comment
-blockclassmethods com.example.Foo {
    skip(int);
    other();
}
-traceclass com.example.Traced
-traceclassmethods com.example.Foo {
    baz;
}
-traceclassmethods _ implements android.app.Activity {
    onResume
}
-allowclassmethodswithparametervalues com.example.Api {
    call(*int,java.lang.String,*long);
}
-tracemethodannotation com.example.Hot
-enablepreciseinstrumentation
-tracesynchronize
-tracelargemethod 40
-traceevilmethodcallee com.example.Db {
    query
}
";

    #[test]
    fn parses_every_directive() {
        let (config, errors) = FilterConfig::parse(CONFIG);

        assert!(errors.is_empty(), "{errors:?}");
        assert!(config.allow_packages.contains("com.example."));
        assert!(config.block_packages.contains("com.example.internal."));
        assert!(config.default_block_packages.contains("android."));
        assert!(config.block_methods.contains("com.example.Foo.skip(int)"));
        assert!(config.block_methods.contains("com.example.Foo.other()"));
        assert!(config.trace_classes.contains("com.example.Traced"));
        assert_eq!(
            TraceMethodRule {
                class_name: "com.example.Foo".to_string(),
                super_name: String::new(),
                method: "baz".to_string(),
            },
            config.trace_methods[0]
        );
        assert_eq!("android.app.Activity", config.trace_methods[1].super_name);
        assert!(config.trace_annotations.contains("com.example.Hot"));
        assert!(config.precise);
        assert!(config.risk.trace_synchronize);
        assert_eq!(40, config.risk.large_method_size);
        assert_eq!(
            vec![("com.example.Db".to_string(), "query".to_string())],
            config.risk.callees
        );
        assert_eq!(Ok(()), config.check());
    }

    #[test]
    fn trace_classes_match_by_prefix() {
        let (config, _) = FilterConfig::parse("-traceclass com.example.net\n");

        assert!(config.is_trace_class("com.example.net.Client.send()void"));
        assert!(config.is_trace_class("com.example.net"));
        assert!(!config.is_trace_class("com.example.Foo.bar()void"));
    }

    #[test]
    fn captured_parameters_match_by_prefix() {
        let (config, _) = FilterConfig::parse(CONFIG);

        assert_eq!(
            Some(&[0usize, 2][..]),
            config.captured_parameters("com.example.Api.call(int,java.lang.String,long)void")
        );
        assert_eq!(None, config.captured_parameters("com.example.Api.other()void"));
    }

    #[test]
    fn malformed_blocks_are_skipped() {
        let text = "
-traceclassmethods a b c d {
    ignored
}
-tracelargemethod many
-traceclass com.example.Kept
";
        let (config, errors) = FilterConfig::parse(text);

        assert_eq!(2, errors.len());
        assert!(matches!(errors[0], ParseError::Directive { line: 2, .. }));
        assert!(config.trace_methods.is_empty());
        assert!(config.trace_classes.contains("com.example.Kept"));
    }

    #[test]
    fn block_outside_allow_is_fatal() {
        let (config, _) = FilterConfig::parse("-allowpackage com.example\n-blockpackage org.other\n");

        assert!(matches!(
            config.check(),
            Err(ConfigConsistencyError::BlockOutsideAllow { .. })
        ));
    }

    #[test]
    fn block_equal_to_allow_is_fatal() {
        let (config, _) = FilterConfig::parse("-allowpackage com.example\n-blockpackage com.example\n");

        assert_eq!(
            Err(ConfigConsistencyError::BlockEqualsAllow("com.example".to_string())),
            config.check()
        );
    }

    #[test]
    fn runtime_package_is_blocked() {
        let mut config = FilterConfig::default();
        config.block_runtime_class("dev/methodtrace/runtime/TraceStub");

        assert!(config.default_block_packages.contains("dev.methodtrace.runtime."));
    }
}
