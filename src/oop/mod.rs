//! Object model interface
//!
//! The feedback loop only needs a narrow view of the object model: class
//! identity and hierarchy, method descriptors with an inlining cost and a
//! body of sends, selector interning, and a way to enumerate GC roots. This
//! module provides exactly that view.

use crate::code::NativeMethodId;
use crate::error::{Error, HandleKind, Result};
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use string_interner::{DefaultStringInterner, DefaultSymbol, Symbol};

/// Call-site location within a method body
pub type Bci = u32;

/// Estimated inlining cost of one send bytecode
pub const SEND_COST: u32 = 4;

/// Estimated inlining cost of a return
pub const RETURN_COST: u32 = 1;

/// Class descriptor identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u32);

/// Method descriptor identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub u32);

/// Interned message selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Selector(DefaultSymbol);

impl Selector {
    /// Stable index of the interned symbol
    pub fn index(self) -> usize {
        self.0.to_usize()
    }
}

/// A GC root retained by a cache, scope or table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Root {
    Class(ClassId),
    Method(MethodId),
    NativeMethod(NativeMethodId),
}

// ==================== Methods ====================

/// Whether a method is a top-level method or a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Method,
    /// Block closure body; `home` is the lexically enclosing method
    Block { home: MethodId },
}

/// Language-level inlining annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InlineHint {
    #[default]
    Default,
    Always,
    Never,
}

/// Where a send's receiver or argument comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// The receiver of the enclosing method
    SelfRef,
    /// Argument of the enclosing method
    Arg(u8),
    /// A literal whose class is known statically
    Literal(ClassId),
    /// A block literal
    Block(MethodId),
    /// Anything else (temporaries, results of other sends)
    Unknown,
}

/// A message send inside a method body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSite {
    pub bci: Bci,
    pub selector: Selector,
    pub receiver: Operand,
    pub args: Vec<Operand>,
    pub is_super: bool,
}

impl SendSite {
    /// Number of arguments statically known to be blocks
    pub fn block_arg_count(&self) -> usize {
        self.args.iter().filter(|a| matches!(a, Operand::Block(_))).count()
    }
}

/// Abstract bytecode: only sends matter to the inliner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bytecode {
    /// Straight-line work with an estimated code cost
    Work { cost: u32 },
    Send(SendSite),
    Return,
}

/// Method descriptor
#[derive(Debug, Clone)]
pub struct Method {
    pub id: MethodId,
    pub selector: Selector,
    pub holder: ClassId,
    pub kind: MethodKind,
    pub hint: InlineHint,
    pub arg_count: u8,
    pub body: Vec<Bytecode>,
    /// Set once a newer definition replaced this one
    pub superseded: bool,
}

impl Method {
    /// Estimated inlining cost of the body
    pub fn cost(&self) -> u32 {
        self.body
            .iter()
            .map(|b| match b {
                Bytecode::Work { cost } => *cost,
                Bytecode::Send(_) => SEND_COST,
                Bytecode::Return => RETURN_COST,
            })
            .sum()
    }

    pub fn is_block(&self) -> bool {
        matches!(self.kind, MethodKind::Block { .. })
    }

    /// Lexically enclosing method of a block
    pub fn home(&self) -> Option<MethodId> {
        match self.kind {
            MethodKind::Block { home } => Some(home),
            MethodKind::Method => None,
        }
    }

    /// All send sites in body order
    pub fn sends(&self) -> impl Iterator<Item = &SendSite> {
        self.body.iter().filter_map(|b| match b {
            Bytecode::Send(site) => Some(site),
            _ => None,
        })
    }

    /// The send site at `bci`
    pub fn send_at(&self, bci: Bci) -> Option<&SendSite> {
        self.sends().find(|s| s.bci == bci)
    }
}

/// Incremental method body construction
#[derive(Debug, Clone)]
pub struct MethodBuilder {
    selector: Selector,
    kind: MethodKind,
    hint: InlineHint,
    arg_count: u8,
    body: Vec<Bytecode>,
    next_bci: Bci,
}

impl MethodBuilder {
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            kind: MethodKind::Method,
            hint: InlineHint::Default,
            arg_count: 0,
            body: Vec::new(),
            next_bci: 0,
        }
    }

    pub fn args(mut self, count: u8) -> Self {
        self.arg_count = count;
        self
    }

    pub fn hint(mut self, hint: InlineHint) -> Self {
        self.hint = hint;
        self
    }

    /// Append straight-line work
    pub fn work(mut self, cost: u32) -> Self {
        self.body.push(Bytecode::Work { cost });
        self.next_bci += 1;
        self
    }

    /// Append a send; its bci is the current body position
    pub fn send(mut self, selector: Selector, receiver: Operand, args: Vec<Operand>) -> Self {
        self.push_send(selector, receiver, args, false);
        self
    }

    /// Append a super send
    pub fn super_send(mut self, selector: Selector, args: Vec<Operand>) -> Self {
        self.push_send(selector, Operand::SelfRef, args, true);
        self
    }

    fn push_send(&mut self, selector: Selector, receiver: Operand, args: Vec<Operand>, is_super: bool) {
        self.body.push(Bytecode::Send(SendSite {
            bci: self.next_bci,
            selector,
            receiver,
            args,
            is_super,
        }));
        self.next_bci += 1;
    }

    pub fn selector(&self) -> Selector {
        self.selector
    }

    /// Bci the next appended bytecode will get
    pub fn next_bci(&self) -> Bci {
        self.next_bci
    }

    fn finish(mut self, id: MethodId, holder: ClassId) -> Method {
        if !matches!(self.body.last(), Some(Bytecode::Return)) {
            self.body.push(Bytecode::Return);
        }
        Method {
            id,
            selector: self.selector,
            holder,
            kind: self.kind,
            hint: self.hint,
            arg_count: self.arg_count,
            body: self.body,
            superseded: false,
        }
    }
}

// ==================== Classes ====================

/// Class descriptor
#[derive(Debug, Clone)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub superclass: Option<ClassId>,
    methods: HashMap<Selector, MethodId>,
}

impl Class {
    /// Locally defined method for `selector`
    pub fn local_method(&self, selector: Selector) -> Option<MethodId> {
        self.methods.get(&selector).copied()
    }
}

/// Classes the compiler has hardcoded knowledge about
#[derive(Debug, Clone, Copy)]
pub struct WellKnownClasses {
    pub object: ClassId,
    pub small_integer: ClassId,
    pub float: ClassId,
    pub array: ClassId,
    pub true_class: ClassId,
    pub false_class: ClassId,
    pub nil: ClassId,
    pub block_closure: ClassId,
}

/// Class and method registry with selector interning
#[derive(Debug, Clone)]
pub struct ClassTable {
    classes: Vec<Class>,
    methods: Vec<Method>,
    selectors: DefaultStringInterner,
    names: HashMap<String, ClassId>,
    well_known: WellKnownClasses,
}

impl ClassTable {
    /// Create a table holding the well-known classes
    pub fn new() -> Self {
        let placeholder = ClassId(0);
        let mut table = Self {
            classes: Vec::new(),
            methods: Vec::new(),
            selectors: DefaultStringInterner::default(),
            names: HashMap::default(),
            well_known: WellKnownClasses {
                object: placeholder,
                small_integer: placeholder,
                float: placeholder,
                array: placeholder,
                true_class: placeholder,
                false_class: placeholder,
                nil: placeholder,
                block_closure: placeholder,
            },
        };
        let object = table.define_class("Object", None);
        let boolean = table.define_class("Boolean", Some(object));
        table.well_known = WellKnownClasses {
            object,
            small_integer: table.define_class("SmallInteger", Some(object)),
            float: table.define_class("Float", Some(object)),
            array: table.define_class("Array", Some(object)),
            true_class: table.define_class("True", Some(boolean)),
            false_class: table.define_class("False", Some(boolean)),
            nil: table.define_class("UndefinedObject", Some(object)),
            block_closure: table.define_class("BlockClosure", Some(object)),
        };
        table
    }

    pub fn well_known(&self) -> &WellKnownClasses {
        &self.well_known
    }

    /// Define a class; redefining a name returns the existing class
    pub fn define_class(&mut self, name: &str, superclass: Option<ClassId>) -> ClassId {
        if let Some(&id) = self.names.get(name) {
            return id;
        }
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(Class {
            id,
            name: name.to_string(),
            superclass,
            methods: HashMap::default(),
        });
        self.names.insert(name.to_string(), id);
        id
    }

    pub fn class(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id.0 as usize)
    }

    pub fn class_named(&self, name: &str) -> Option<ClassId> {
        self.names.get(name).copied()
    }

    /// Class name, or a placeholder for unknown ids
    pub fn class_name(&self, id: ClassId) -> &str {
        self.class(id).map(|c| c.name.as_str()).unwrap_or("<unknown class>")
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Intern a selector
    pub fn intern(&mut self, name: &str) -> Selector {
        Selector(self.selectors.get_or_intern(name))
    }

    /// Look up an already interned selector
    pub fn selector(&self, name: &str) -> Option<Selector> {
        self.selectors.get(name).map(Selector)
    }

    pub fn selector_name(&self, selector: Selector) -> &str {
        self.selectors.resolve(selector.0).unwrap_or("<unknown selector>")
    }

    pub fn method(&self, id: MethodId) -> Option<&Method> {
        self.methods.get(id.0 as usize)
    }

    /// Like [`ClassTable::method`] but failing with an error
    pub fn method_checked(&self, id: MethodId) -> Result<&Method> {
        self.method(id)
            .ok_or_else(|| Error::invalid_handle(HandleKind::Method, id.0 as usize))
    }

    /// Install a method in `class`, replacing any previous local definition
    pub fn add_method(&mut self, class: ClassId, builder: MethodBuilder) -> Result<MethodId> {
        let selector = builder.selector;
        let id = MethodId(self.methods.len() as u32);
        let class_entry = self
            .classes
            .get_mut(class.0 as usize)
            .ok_or_else(|| Error::invalid_handle(HandleKind::Class, class.0 as usize))?;
        if let Some(old) = class_entry.methods.insert(selector, id) {
            self.methods[old.0 as usize].superseded = true;
        }
        self.methods.push(builder.finish(id, class));
        Ok(id)
    }

    /// Create a block method nested in `home`
    pub fn add_block(&mut self, home: MethodId, builder: MethodBuilder) -> Result<MethodId> {
        let holder = self.method_checked(home)?.holder;
        let id = MethodId(self.methods.len() as u32);
        let mut builder = builder;
        builder.kind = MethodKind::Block { home };
        self.methods.push(builder.finish(id, holder));
        Ok(id)
    }

    /// Method lookup along the superclass chain
    pub fn lookup(&self, class: ClassId, selector: Selector) -> Option<MethodId> {
        let mut current = Some(class);
        while let Some(id) = current {
            let entry = self.class(id)?;
            if let Some(m) = entry.local_method(selector) {
                return Some(m);
            }
            current = entry.superclass;
        }
        None
    }

    /// Lookup starting at the superclass of `holder`
    pub fn super_lookup(&self, holder: ClassId, selector: Selector) -> Option<MethodId> {
        let superclass = self.class(holder)?.superclass?;
        self.lookup(superclass, selector)
    }

    /// Whether `class` is `ancestor` or one of its subclasses
    pub fn inherits_from(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.class(id).and_then(|c| c.superclass);
        }
        false
    }

    /// Receivers with compiler-known primitive representations
    pub fn is_primitive_class(&self, class: ClassId) -> bool {
        let wk = &self.well_known;
        [wk.small_integer, wk.float, wk.array, wk.true_class, wk.false_class].contains(&class)
    }

    /// Whether `selector` invokes a block (`value`, `value:`, ...)
    pub fn is_block_invocation(&self, selector: Selector) -> bool {
        let name = self.selector_name(selector);
        name == "value" || (name.starts_with("value:") && name.split(':').all(|p| p.is_empty() || p == "value"))
    }

    /// Enumerate every class and method as a GC root
    pub fn trace_roots(&self, visit: &mut dyn FnMut(Root)) {
        for class in &self.classes {
            visit(Root::Class(class.id));
        }
        for method in &self.methods {
            visit(Root::Method(method.id));
        }
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}
