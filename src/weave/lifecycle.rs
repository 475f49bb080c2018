//! Startup hooks for the application entry class.

use tracing::{debug, warn};

use crate::classfile::code::{self, CodeAttribute, Patch};
use crate::classfile::{
    ACC_ABSTRACT, ACC_NATIVE, ACC_PROTECTED, ClassFile, MemberInfo, RawAttribute,
};
use crate::error::RewriteError;
use crate::opcodes::{ALOAD_0, ALOAD_1, INVOKESPECIAL, INVOKESTATIC, RETURN};

use super::{ClassPass, WeaveContext, invoke};

const ATTACH: &str = "attachBaseContext";
const ON_CREATE: &str = "onCreate";
const CONTEXT_DESC: &str = "(Landroid/content/Context;)V";

/// Calls the lifecycle hook class at the top of `attachBaseContext` and `onCreate`,
/// adding overrides that delegate to the superclass when the class has none.
pub(crate) struct LifecyclePass;

impl ClassPass for LifecyclePass {
    fn name(&self) -> &'static str {
        "application-lifecycle"
    }

    fn apply(&self, class: &mut ClassFile, ctx: &WeaveContext<'_>) -> Result<bool, RewriteError> {
        let Some(application) = ctx.config.application.as_deref() else {
            return Ok(false);
        };
        let dotted = class.name()?.replace('/', ".");
        if ctx.mapper.original_class_name(&dotted, &dotted) != application {
            return Ok(false);
        }
        let Some(super_name) = class.super_name()? else {
            warn!("application class {dotted} has no superclass, skipping lifecycle hooks");
            return Ok(false);
        };
        let hook_class = ctx.config.hooks.lifecycle_class.as_str();

        let attach_hook = class.pool.add_method_ref(hook_class, ATTACH, CONTEXT_DESC)?;
        let mut attach_call = vec![ALOAD_1];
        invoke(&mut attach_call, INVOKESTATIC, attach_hook);
        match class.find_method(ATTACH, CONTEXT_DESC) {
            Some(index) => hook_existing(class, index, attach_call)?,
            None => {
                let super_attach = class.pool.add_method_ref(&super_name, ATTACH, CONTEXT_DESC)?;
                let mut body = attach_call;
                body.extend_from_slice(&[ALOAD_0, ALOAD_1]);
                invoke(&mut body, INVOKESPECIAL, super_attach);
                body.push(RETURN);
                add_method(class, ATTACH, CONTEXT_DESC, 2, 2, body)?;
            }
        }

        let create_hook = class.pool.add_method_ref(hook_class, ON_CREATE, CONTEXT_DESC)?;
        let mut create_call = vec![ALOAD_0];
        invoke(&mut create_call, INVOKESTATIC, create_hook);
        match class.find_method(ON_CREATE, "()V") {
            Some(index) => hook_existing(class, index, create_call)?,
            None => {
                let super_create = class.pool.add_method_ref(&super_name, ON_CREATE, "()V")?;
                // super.onCreate() runs before the hook, unlike attachBaseContext above.
                let mut body = vec![ALOAD_0];
                invoke(&mut body, INVOKESPECIAL, super_create);
                body.extend_from_slice(&create_call);
                body.push(RETURN);
                add_method(class, ON_CREATE, "()V", 1, 1, body)?;
            }
        }
        debug!("added lifecycle hooks to {dotted}");
        Ok(true)
    }
}

fn hook_existing(class: &mut ClassFile, index: usize, call: Vec<u8>) -> Result<(), RewriteError> {
    if class.methods[index].access_flags & (ACC_ABSTRACT | ACC_NATIVE) != 0 {
        debug!("{} has no body to hook", code::method_label(class, index));
        return Ok(());
    }
    let patch = Patch {
        prologue: call,
        extra_stack: 1,
        ..Patch::default()
    };
    code::apply_patch(class, index, &patch)
}

fn add_method(
    class: &mut ClassFile,
    name: &str,
    descriptor: &str,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
) -> Result<(), RewriteError> {
    let body = CodeAttribute {
        max_stack,
        max_locals,
        code,
        exception_table: Vec::new(),
        attributes: Vec::new(),
    };
    let code_name = class.pool.add_utf8("Code")?;
    let name_index = class.pool.add_utf8(name)?;
    let descriptor_index = class.pool.add_utf8(descriptor)?;
    class.methods.push(MemberInfo {
        access_flags: ACC_PROTECTED,
        name_index,
        descriptor_index,
        attributes: vec![RawAttribute {
            name_index: code_name,
            info: body.to_bytes(),
        }],
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, MethodRecord};
    use crate::classfile::ACC_PUBLIC;
    use crate::config::WeaveConfig;
    use crate::filter::FilterConfig;
    use crate::mapping::IdentityMapper;
    use crate::classfile::testing::ClassBuilder;
    use crate::weave::Weaver;

    const HOOKS: &str = "dev/methodtrace/runtime/TraceApplication";

    fn run(bytes: &[u8], catalog: &Catalog, mapping: &str) -> Option<ClassFile> {
        let (mapper, _) = IdentityMapper::parse(mapping);
        let filter = FilterConfig::default();
        let config = WeaveConfig {
            application: Some("com.example.App".to_string()),
            ..WeaveConfig::default()
        };
        let weaver = Weaver::new(WeaveContext {
            catalog,
            mapper: &mapper,
            filter: &filter,
            config: &config,
        });
        weaver
            .rewrite(bytes)
            .expect("rewrite")
            .map(|bytes| ClassFile::parse(&bytes).expect("parse rewritten"))
    }

    fn body(class: &ClassFile, name: &str, descriptor: &str) -> (u16, Vec<u8>) {
        let index = class.find_method(name, descriptor).expect("method present");
        let code = code::method_code(class, index)
            .expect("code")
            .expect("has code")
            .1;
        (class.methods[index].access_flags, code.code)
    }

    fn method_ref(class: &mut ClassFile, owner: &str, name: &str, descriptor: &str) -> [u8; 2] {
        class
            .pool
            .add_method_ref(owner, name, descriptor)
            .expect("method ref")
            .to_be_bytes()
    }

    #[test]
    fn missing_overrides_are_synthesized() {
        let builder = ClassBuilder::new("a/b", "android/app/Application");
        let mut class = run(
            &builder.build(),
            &Catalog::default(),
            "com.example.App -> a.b:\n",
        )
        .expect("application rewritten");

        let [ah, al] = method_ref(&mut class, HOOKS, ATTACH, CONTEXT_DESC);
        let [sh, sl] = method_ref(&mut class, "android/app/Application", ATTACH, CONTEXT_DESC);
        let (access, attach) = body(&class, ATTACH, CONTEXT_DESC);
        assert_eq!(ACC_PROTECTED, access);
        assert_eq!(
            vec![ALOAD_1, INVOKESTATIC, ah, al, ALOAD_0, ALOAD_1, INVOKESPECIAL, sh, sl, RETURN],
            attach
        );

        let [ch, cl] = method_ref(&mut class, HOOKS, ON_CREATE, CONTEXT_DESC);
        let [oh, ol] = method_ref(&mut class, "android/app/Application", ON_CREATE, "()V");
        let (_, create) = body(&class, ON_CREATE, "()V");
        assert_eq!(
            vec![ALOAD_0, INVOKESPECIAL, oh, ol, ALOAD_0, INVOKESTATIC, ch, cl, RETURN],
            create
        );
    }

    #[test]
    fn existing_overrides_call_the_hook_before_the_probe() {
        let mut builder = ClassBuilder::new("com/example/App", "android/app/Application");
        let helper = builder.method_ref("com/example/App", "setup", "()V");
        let [hh, hl] = helper.to_be_bytes();
        builder.method(
            ACC_PUBLIC,
            ON_CREATE,
            "()V",
            1,
            1,
            vec![ALOAD_0, 0xb6, hh, hl, ALOAD_0, 0xb6, hh, hl, RETURN],
        );
        let catalog = Catalog::default();
        catalog.instrument(MethodRecord::new(ACC_PUBLIC, "com/example/App", ON_CREATE, "()V"));

        let mut class = run(&builder.build(), &catalog, "").expect("application rewritten");

        let [ch, cl] = method_ref(&mut class, HOOKS, ON_CREATE, CONTEXT_DESC);
        let (access, create) = body(&class, ON_CREATE, "()V");
        assert_eq!(ACC_PUBLIC, access);
        assert_eq!(vec![ALOAD_0, INVOKESTATIC, ch, cl, 0x04, INVOKESTATIC], create[..6].to_vec());
        assert!(class.find_method(ATTACH, CONTEXT_DESC).is_some());
    }

    #[test]
    fn other_classes_are_untouched() {
        let builder = ClassBuilder::new("com/example/Other", "java/lang/Object");

        assert!(run(&builder.build(), &Catalog::default(), "").is_none());
    }
}
