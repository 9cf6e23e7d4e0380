//! Deterministic textual IR printer.
//!
//! Output is stable for a given module: items are printed in module order,
//! blocks in layout order, and nothing depends on hash iteration order. The
//! parser accepts everything printed here.

use super::{ConstantPool, Function, InstId, InstKind, Module, StringConstant, Type};

pub fn print_module(module: &Module) -> String {
    let mut output = String::new();

    if !module.name.is_empty() && module.name != "module" {
        output.push_str(&format!("module \"{}\"\n\n", escape(module.name.as_bytes())));
    }

    for global in &module.globals {
        output.push_str(&format!("global @{}: {} = {}\n", global.name, global.ty, global.init));
    }
    if !module.globals.is_empty() {
        output.push('\n');
    }

    for (_, constant) in module.constants.iter() {
        output.push_str(&print_string(constant));
        output.push('\n');
    }
    if !module.constants.is_empty() {
        output.push('\n');
    }

    let declarations = module.functions.iter().filter(|f| f.is_declaration);
    let mut any_declaration = false;
    for func in declarations {
        any_declaration = true;
        output.push_str(&print_declaration(func));
        output.push('\n');
    }
    if any_declaration {
        output.push('\n');
    }

    for func in module.functions.iter().filter(|f| !f.is_declaration) {
        output.push_str(&print_function(func, &module.constants));
        output.push('\n');
    }

    while output.ends_with("\n\n") {
        output.pop();
    }
    output
}

fn print_string(constant: &StringConstant) -> String {
    let mut line = format!("string @{} = \"{}\"", constant.name, escape(&constant.bytes));
    if constant.origin == super::ConstOrigin::Generated {
        line.push_str(" generated");
    }
    if let Some(key) = constant.key {
        line.push_str(&format!(" encrypted {:#x}", key));
    }
    line
}

/// Escape bytes for a quoted literal. Printable ASCII stays as is.
pub fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\{:02X}", b)),
        }
    }
    out
}

fn print_attrs(func: &Function) -> String {
    func.attrs.iter().map(|a| format!(" #{}", a.name())).collect()
}

fn print_declaration(func: &Function) -> String {
    let params: Vec<String> = func.param_types().iter().map(|t| t.to_string()).collect();
    format!(
        "declare @{}({}) -> {}{}",
        func.name,
        params.join(", "),
        func.ret_ty,
        print_attrs(func)
    )
}

pub fn print_function(func: &Function, pool: &ConstantPool) -> String {
    let params: Vec<String> = func
        .params
        .iter()
        .map(|p| format!("%{}: {}", func.value_name(*p), func.value_ty(*p)))
        .collect();
    let mut output = format!(
        "define @{}({}) -> {}{} {{\n",
        func.name,
        params.join(", "),
        func.ret_ty,
        print_attrs(func)
    );

    for &block in func.layout() {
        output.push_str(&format!("{}:\n", func.block_name(block)));
        for &inst in func.block_insts(block) {
            output.push_str("  ");
            output.push_str(&print_inst(func, pool, inst));
            output.push('\n');
        }
    }

    output.push_str("}\n");
    output
}

/// Render one instruction without indentation.
pub fn print_inst(func: &Function, pool: &ConstantPool, inst: InstId) -> String {
    let data = func.inst(inst);
    let v = |id: super::ValueId| {
        if func.is_valid_value(id) {
            format!("%{}", func.value_name(id))
        } else {
            format!("%<invalid {}>", id.0)
        }
    };
    let b = |id: super::BlockId| format!("^{}", func.block_name_or_placeholder(id));

    let body = match &data.kind {
        InstKind::Const { value } => format!("const {} {}", data.ty, value),
        InstKind::Binary { op, lhs, rhs } => {
            format!("{} {} {}, {}", op.name(), data.ty, v(*lhs), v(*rhs))
        }
        InstKind::Icmp { pred, lhs, rhs } => format!("icmp {} {}, {}", pred.name(), v(*lhs), v(*rhs)),
        InstKind::Select { cond, on_true, on_false } => format!(
            "select {} {}, {}, {}",
            data.ty,
            v(*cond),
            v(*on_true),
            v(*on_false)
        ),
        InstKind::Cast { op, value } => format!("{} {} {}", op.name(), data.ty, v(*value)),
        InstKind::Alloca { elem, count } => {
            if *count == 1 {
                format!("alloca {}", elem)
            } else {
                format!("alloca {}, {}", elem, count)
            }
        }
        InstKind::Load { ptr, volatile } => format!(
            "load {}{} {}",
            if *volatile { "volatile " } else { "" },
            data.ty,
            v(*ptr)
        ),
        InstKind::Store { value, ptr, volatile } => format!(
            "store {}{}, {}",
            if *volatile { "volatile " } else { "" },
            v(*value),
            v(*ptr)
        ),
        InstKind::Gep { base, offset } => format!("gep {}, {}", v(*base), v(*offset)),
        InstKind::StrRef { constant } => match pool.get(*constant) {
            Some(c) => format!("str @{}", c.name),
            None => format!("str @<invalid {}>", constant.0),
        },
        InstKind::GlobalAddr { global } => format!("global @{}", global),
        InstKind::BlockAddr { block } => format!("blockaddr {}", b(*block)),
        InstKind::Call { callee, args } => {
            let args: Vec<String> = args.iter().map(|a| v(*a)).collect();
            if data.ty == Type::Void {
                format!("call @{}({})", callee, args.join(", "))
            } else {
                format!("call {} @{}({})", data.ty, callee, args.join(", "))
            }
        }
        InstKind::CallIndirect { callee, args } => {
            let args: Vec<String> = args.iter().map(|a| v(*a)).collect();
            if data.ty == Type::Void {
                format!("call {}({})", v(*callee), args.join(", "))
            } else {
                format!("call {} {}({})", data.ty, v(*callee), args.join(", "))
            }
        }
        InstKind::Phi { incoming } => {
            let entries: Vec<String> = incoming
                .iter()
                .map(|(block, value)| format!("[{}, {}]", b(*block), v(*value)))
                .collect();
            format!("phi {} {}", data.ty, entries.join(", "))
        }
        InstKind::Br { target } => format!("br {}", b(*target)),
        InstKind::CondBr { cond, then_dest, else_dest } => {
            format!("condbr {}, {}, {}", v(*cond), b(*then_dest), b(*else_dest))
        }
        InstKind::Switch { value, default, cases } => {
            let cases: Vec<String> = cases
                .iter()
                .map(|(case, block)| format!("{}: {}", case, b(*block)))
                .collect();
            format!("switch {}, {} [{}]", v(*value), b(*default), cases.join(", "))
        }
        InstKind::IndirectBr { addr, dests } => {
            let dests: Vec<String> = dests.iter().map(|d| b(*d)).collect();
            format!("indirectbr {}, [{}]", v(*addr), dests.join(", "))
        }
        InstKind::Ret { value: Some(value) } => format!("ret {}", v(*value)),
        InstKind::Ret { value: None } => "ret".to_string(),
        InstKind::Unreachable => "unreachable".to_string(),
    };

    match data.result {
        Some(result) => format!("{} = {}", v(result), body),
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse_module;
    use super::*;

    const SAMPLE: &str = r#"global @obf.opaque_key: i32 = 0

string @.msg = "hi \"there\"\0A"
string @.key = "\01\FF" encrypted 0x2a

declare @puts(ptr) -> i32

define @main(%n: i32) -> i32 #noinline {
entry:
  %zero = const i32 0
  %neg = icmp slt %n, %zero
  condbr %neg, ^flip, ^done
flip:
  %m = sub i32 %zero, %n
  %p = str @.msg
  %r0 = call i32 @puts(%p)
  br ^done
done:
  %r = phi i32 [^entry, %n], [^flip, %m]
  switch %r, ^out [1: ^out, -2: ^out]
out:
  ret %r
}
"#;

    #[test]
    fn test_print_parse_fixpoint() {
        let module = parse_module(SAMPLE).unwrap();
        let printed = module.print();
        assert_eq!(printed, SAMPLE);
        let reparsed = parse_module(&printed).unwrap();
        assert_eq!(reparsed.print(), printed);
    }

    #[test]
    fn test_escape_non_printable() {
        assert_eq!(escape(b"a\nb\\"), "a\\0Ab\\\\");
    }
}
