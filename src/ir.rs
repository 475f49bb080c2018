/// Intermediate representation for parsed JVM classes and methods.
#[derive(Clone, Debug)]
pub(crate) struct Class {
    /// Internal name, `com/example/Foo`.
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) methods: Vec<Method>,
}

/// Intermediate representation for a method and its bytecode.
#[derive(Clone, Debug)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: MethodAccess,
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) cfg: ControlFlowGraph,
    pub(crate) calls: Vec<CallSite>,
    /// Annotation types in internal form, visible and invisible.
    pub(crate) annotations: Vec<String>,
}

/// Method access flags used for filtering and the catalog.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct MethodAccess {
    pub(crate) flags: u16,
    pub(crate) is_native: bool,
    pub(crate) is_synchronized: bool,
}

/// Edges between basic blocks of a method body.
#[derive(Clone, Debug, Default)]
pub(crate) struct ControlFlowGraph {
    pub(crate) edges: Vec<FlowEdge>,
}

/// Edge between basic blocks.
#[derive(Clone, Debug)]
pub(crate) struct FlowEdge {
    pub(crate) from: u32,
    pub(crate) to: u32,
    pub(crate) kind: EdgeKind,
}

/// Edge classification used for CFG inspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum EdgeKind {
    FallThrough,
    Branch,
}

/// Bytecode instruction captured for analysis.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Instruction {
    pub(crate) offset: u32,
    pub(crate) opcode: u8,
}

/// Resolved target of an `invoke*` instruction.
#[derive(Clone, Debug)]
pub(crate) struct CallSite {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl Method {
    /// Call instructions, counting `invokedynamic`.
    pub(crate) fn call_count(&self) -> usize {
        self.instructions
            .iter()
            .filter(|inst| crate::opcodes::is_invoke(inst.opcode))
            .count()
    }

    pub(crate) fn has_body(&self) -> bool {
        !self.instructions.is_empty()
    }
}
