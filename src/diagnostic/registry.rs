/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    pub short: &'static str,  // one line, for listings
    pub long: &'static str,   // full explanation for --explain
}

/// All stable error codes for qxlang.
pub static REGISTRY: &[ErrorEntry] = &[
    // ── Compile ──────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "QX-C001",
        short: "duplicate label",
        long: r#"## QX-C001: duplicate label

Every `:name` line defines a label, and a name may be defined only once
per program, wherever the two definitions appear.

**Example that triggers this:**

    :loop
    pass
    :loop

**Fix:** rename one of the labels.
"#,
    },
    ErrorEntry {
        code: "QX-C002",
        short: "unterminated backtick literal",
        long: r#"## QX-C002: unterminated backtick literal

A backtick literal may span several lines; it ends at the next backtick.
This error means the source ended while a literal was still open.

**Example that triggers this:**

    pln `first line
    second line

**Fix:** close the literal with a backtick.
"#,
    },
    ErrorEntry {
        code: "QX-C003",
        short: "unclosed quote",
        long: r#"## QX-C003: unclosed quote

A token opened a single or double quote that is not closed on the same
line. Only backtick literals may span lines.

**Example that triggers this:**

    pln 'oops
"#,
    },
    ErrorEntry {
        code: "QX-C004",
        short: "unknown instruction",
        long: r#"## QX-C004: unknown instruction

The first token of each line names the instruction. Known mnemonics:

    invalidInstr version pass testByText goto onError defer exit
    push peek pop = if < call ret getArrayItem [] now pln plo sleep
    getClipText setClipText getEnv setEnv removeEnv getArgs getInput
    systemCmd ++i --i +i -t

`defer` takes another instruction as its first operand; that name must
also be in this list and may not be `defer`.
"#,
    },
    // ── Runtime ──────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "QX-R001",
        short: "invalid reference",
        long: r#"## QX-R001: invalid reference

An operand could not be read or written: a local slot past `$9`, a
write to a constant, a jump outside the program, a lookup on an
undefined value, a missing map key, or a deferred `@` expression (which
are stored but never evaluated).
"#,
    },
    ErrorEntry {
        code: "QX-R002",
        short: "index out of range",
        long: r#"## QX-R002: index out of range

An element or slice index fell outside the collection.

**Example that triggers this:**

    = $1 #L[1,2,3]
    [] $2 $1 #i3

**Fix:** pass a default as a fourth operand (`[] $2 $1 #i3 #i0`) or use
the `[base|index|default]` operand form.
"#,
    },
    ErrorEntry {
        code: "QX-R003",
        short: "condition is not a bool",
        long: r#"## QX-R003: condition is not a bool

`if` requires its first operand to be a bool. Comparisons such as `<`
produce one.
"#,
    },
    ErrorEntry {
        code: "QX-R004",
        short: "type mismatch",
        long: r#"## QX-R004: type mismatch

An instruction received a value of the wrong type, such as `+i` with a
non-int operand, or a value that could not be converted. Faults inside
an instruction handler are reported with this code as well, naming the
instruction and its address.
"#,
    },
    ErrorEntry {
        code: "QX-R005",
        short: "unresolved label",
        long: r#"## QX-R005: unresolved label

A jump named a label that no line defines. Labels are resolved when the
jump is taken, so a program with an undefined label still compiles.
"#,
    },
    ErrorEntry {
        code: "QX-R006",
        short: "return without call",
        long: r#"## QX-R006: return without call

`ret` executed with no matching `call` on the call stack.
"#,
    },
    ErrorEntry {
        code: "QX-R007",
        short: "missing arguments",
        long: r#"## QX-R007: missing arguments

The instruction needs more operands than were given, e.g. `= $1`.
"#,
    },
    ErrorEntry {
        code: "QX-R008",
        short: "invalid instruction",
        long: r#"## QX-R008: invalid instruction

Raised by `invalidInstr`, by an unknown opcode, and by `defer` of a
control-flow instruction (`goto`, `if`, `call`, `ret`, `exit`, `onError`).
"#,
    },
    ErrorEntry {
        code: "QX-R009",
        short: "test failed",
        long: r#"## QX-R009: test failed

`testByText` compares the text forms of its first two operands and
fails when they differ.
"#,
    },
    ErrorEntry {
        code: "QX-R010",
        short: "partially lowered program",
        long: r#"## QX-R010: partially lowered program

`--lowered` only supports `=` and `+i` over constants and `$N` slots.
A program containing anything else must run without `--lowered`.
"#,
    },
];

pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    REGISTRY.iter().find(|e| e.code.eq_ignore_ascii_case(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmError;

    #[test]
    fn lookup_known_code() {
        let e = lookup("QX-R002").expect("QX-R002 should be in registry");
        assert_eq!(e.code, "QX-R002");
        assert!(e.long.contains("default"));
        assert!(lookup("qx-c001").is_some());
    }

    #[test]
    fn lookup_unknown_returns_none() {
        assert!(lookup("QX-XXXX").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn all_codes_unique() {
        let mut codes: Vec<&str> = REGISTRY.iter().map(|e| e.code).collect();
        codes.sort_unstable();
        let before = codes.len();
        codes.dedup();
        assert_eq!(codes.len(), before, "duplicate error code in registry");
    }

    #[test]
    fn all_codes_have_content() {
        for entry in REGISTRY {
            assert!(!entry.short.is_empty(), "{} missing short description", entry.code);
            assert!(entry.long.contains(entry.code), "{} long text should name its code", entry.code);
        }
    }

    #[test]
    fn every_vm_error_is_registered() {
        let errors = [
            VmError::InvalidReference(String::new()),
            VmError::IndexOutOfRange { index: 0, len: 0 },
            VmError::InvalidCondition { found: "int" },
            VmError::TypeMismatch(String::new()),
            VmError::UnresolvedLabel(String::new()),
            VmError::EmptyCallStack,
            VmError::MissingArguments { mnemonic: "=", expected: 2, got: 0 },
            VmError::InvalidInstruction(String::new()),
            VmError::TestFailed { name: String::new(), left: String::new(), right: String::new() },
            VmError::PartialLowering { count: 1, first: 0 },
        ];
        for e in &errors {
            assert!(lookup(e.code()).is_some(), "{} not registered", e.code());
        }
    }
}
