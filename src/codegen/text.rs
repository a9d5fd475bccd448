//! The instruction-to-code-text contract.
//!
//! Every instruction variant maps deterministically to one line of target
//! text; external emitters are interchangeable because this mapping, and
//! the canonical runtime symbols it names (`cil2cpp::array_create`,
//! `cil2cpp::string_concat`, `cil2cpp::checked_add`,
//! `cil2cpp::checked_conv<T>`, `cil2cpp::object_as`,
//! `cil2cpp::object_cast`, `cil2cpp::gc::alloc`, `cil2cpp::icall::*`,
//! `object_memberwise_clone`, `array_data`, `array_length`,
//! `array_get_subarray`), is part of the stable API with the runtime.

use crate::ir::InstKind;

/// Target-language default for a rendered type; empty for `void`.
pub fn default_value(target_type: &str) -> String {
    match target_type {
        "void" => String::new(),
        "bool" => "false".into(),
        "float" => "0.0f".into(),
        "double" => "0.0".into(),
        t if t.ends_with('*') => "nullptr".into(),
        "int8_t" | "uint8_t" | "int16_t" | "uint16_t" | "int32_t" | "uint32_t" | "int64_t"
        | "uint64_t" | "intptr_t" | "uintptr_t" | "char16_t" => "0".into(),
        _ => "{}".into(),
    }
}

/// One line of target text for an instruction.
pub fn instruction_text(kind: &InstKind) -> String {
    use InstKind::*;
    match kind {
        Comment(text) => format!("// {text}"),
        DeclareLocal {
            name,
            var_type,
            init,
        } => match init {
            Some(init) => format!("{var_type} {name} = {init};"),
            None => format!("{var_type} {name};"),
        },
        Assign { target, value } => format!("{target} = {value};"),
        LoadArg { arg, result } => format!("{result} = {arg};"),
        LoadLocal { local, result } => format!("{result} = {local};"),
        LoadField {
            object,
            field,
            result,
        } => format!("{result} = {object}->{field};"),
        LoadStaticField {
            owner,
            field,
            result,
        } => format!("{result} = {owner}_statics.{field};"),
        LoadArrayElement {
            array,
            index,
            element_type,
            result,
        } => format!("{result} = cil2cpp::array_data<{element_type}>({array})[{index}];"),
        LoadIndirect {
            address,
            value_type,
            result,
        } => format!("{result} = *({value_type}*){address};"),
        StoreArg { arg, value } => format!("{arg} = {value};"),
        StoreLocal { local, value } => format!("{local} = {value};"),
        StoreField {
            object,
            field,
            value,
        } => format!("{object}->{field} = {value};"),
        StoreStaticField {
            owner,
            field,
            value,
        } => format!("{owner}_statics.{field} = {value};"),
        StoreArrayElement {
            array,
            index,
            element_type,
            value,
        } => format!("cil2cpp::array_data<{element_type}>({array})[{index}] = {value};"),
        StoreIndirect {
            address,
            value_type,
            value,
        } => format!("*({value_type}*){address} = {value};"),
        BinaryOp {
            op,
            left,
            right,
            result,
            ..
        } => format!("{result} = {left} {op} {right};"),
        UnaryOp {
            op,
            operand,
            result,
            ..
        } => format!("{result} = {op}{operand};"),
        Branch { target } => format!("goto {target};"),
        ConditionalBranch {
            condition,
            true_target,
            false_target,
        } => match false_target {
            Some(false_target) => {
                format!("if ({condition}) goto {true_target}; else goto {false_target};")
            }
            None => format!("if ({condition}) goto {true_target};"),
        },
        Switch {
            value,
            targets,
            default,
        } => {
            let mut cases: Vec<String> = targets
                .iter()
                .enumerate()
                .map(|(i, label)| format!("case {i}: goto {label};"))
                .collect();
            if let Some(default) = default {
                cases.push(format!("default: goto {default};"));
            }
            format!("switch ({value}) {{ {} }}", cases.join(" "))
        }
        Label { name } => format!("{name}:;"),
        Call {
            callee,
            is_virtual,
            vtable_slot,
            is_interface_call,
            receiver,
            args,
            result,
            ..
        } => {
            let mut call_args: Vec<String> = Vec::new();
            if let Some(receiver) = receiver {
                call_args.push(receiver.clone());
            }
            call_args.extend(args.iter().cloned());
            let invocation = if *is_interface_call {
                let receiver = receiver.clone().unwrap_or_default();
                format!(
                    "cil2cpp::interface_dispatch({receiver}, {vtable_slot})({})",
                    call_args.join(", ")
                )
            } else if *is_virtual {
                let receiver = receiver.clone().unwrap_or_default();
                format!(
                    "cil2cpp::vtable_dispatch({receiver}, {vtable_slot})({})",
                    call_args.join(", ")
                )
            } else {
                format!("{callee}({})", call_args.join(", "))
            };
            match result {
                Some(result) => format!("{result} = {invocation};"),
                None => format!("{invocation};"),
            }
        }
        NewObj {
            type_name,
            ctor,
            args,
            result,
        } => {
            let mut ctor_args = vec![result.clone()];
            ctor_args.extend(args.iter().cloned());
            format!(
                "{result} = cil2cpp::gc::alloc(&{type_name}_typeinfo); {ctor}({});",
                ctor_args.join(", ")
            )
        }
        NewArray {
            element_type,
            length,
            result,
        } => format!("{result} = cil2cpp::array_create<{element_type}>({length});"),
        DelegateCreate {
            delegate_type,
            object,
            function,
            result,
        } => format!(
            "{result} = cil2cpp::delegate_create(&{delegate_type}_typeinfo, {object}, {function});"
        ),
        DelegateInvoke {
            delegate,
            args,
            result,
            ..
        } => {
            let mut all = vec![delegate.clone()];
            all.extend(args.iter().cloned());
            let invocation = format!("cil2cpp::delegate_invoke({})", all.join(", "));
            match result {
                Some(result) => format!("{result} = {invocation};"),
                None => format!("{invocation};"),
            }
        }
        LoadFunctionPointer {
            method,
            is_virtual,
            result,
        } => {
            if *is_virtual {
                format!("{result} = cil2cpp::ldvirtftn(&{method});")
            } else {
                format!("{result} = (void*)&{method};")
            }
        }
        Cast {
            value,
            target_type,
            safe,
            result,
        } => {
            if *safe {
                format!("{result} = cil2cpp::object_as<{target_type}>({value});")
            } else {
                format!("{result} = cil2cpp::object_cast<{target_type}>({value});")
            }
        }
        Convert {
            value,
            target_scalar,
            result,
        } => format!("{result} = ({target_scalar}){value};"),
        Box {
            value,
            value_type_cpp_name,
            result,
        } => format!("{result} = cil2cpp::box<{value_type_cpp_name}>({value});"),
        Unbox {
            value,
            value_type_cpp_name,
            result,
        } => format!("{result} = cil2cpp::unbox<{value_type_cpp_name}>({value});"),
        TryBegin => "CIL2CPP_TRY {".into(),
        CatchBegin {
            exception_type,
            variable,
        } => match variable {
            Some(variable) => format!("}} CIL2CPP_CATCH({exception_type}, {variable}) {{"),
            None => format!("}} CIL2CPP_CATCH({exception_type}, ) {{"),
        },
        FinallyBegin => "} CIL2CPP_FINALLY {".into(),
        FilterBegin => "} CIL2CPP_FILTER {".into(),
        FilterHandlerBegin => "} CIL2CPP_FILTER_HANDLER {".into(),
        EndFilter { result } => format!("CIL2CPP_ENDFILTER({result});"),
        TryEnd => "} CIL2CPP_TRY_END;".into(),
        Throw { exception } => format!("cil2cpp::throw_exception({exception});"),
        Rethrow => "cil2cpp::rethrow();".into(),
        Return { value } => match value {
            Some(value) => format!("return {value};"),
            None => "return;".into(),
        },
        StaticCtorGuard { type_name } => format!("{type_name}_ensure_cctor();"),
        RawTargetCode { code, .. } => code.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_op_follows_the_documented_shape() {
        let kind = InstKind::BinaryOp {
            op: "+".into(),
            left: "__t0".into(),
            right: "__t1".into(),
            result: "__t2".into(),
            result_type: "int32_t".into(),
        };
        assert_eq!(instruction_text(&kind), "__t2 = __t0 + __t1;");
    }

    #[test]
    fn canonical_runtime_symbols_appear() {
        let newarr = InstKind::NewArray {
            element_type: "int32_t".into(),
            length: "__t0".into(),
            result: "__t1".into(),
        };
        assert!(instruction_text(&newarr).contains("cil2cpp::array_create"));

        let cast = InstKind::Cast {
            value: "__t0".into(),
            target_type: "Animal*".into(),
            safe: true,
            result: "__t1".into(),
        };
        assert!(instruction_text(&cast).contains("cil2cpp::object_as"));

        let alloc = InstKind::NewObj {
            type_name: "Calculator".into(),
            ctor: "Calculator__ctor".into(),
            args: vec![],
            result: "__t0".into(),
        };
        assert!(instruction_text(&alloc).contains("cil2cpp::gc::alloc"));
    }

    #[test]
    fn end_filter_reads_the_filter_local() {
        let kind = InstKind::EndFilter {
            result: "__filter_result".into(),
        };
        assert_eq!(instruction_text(&kind), "CIL2CPP_ENDFILTER(__filter_result);");
    }

    #[test]
    fn defaults_cover_scalars_pointers_and_structs() {
        assert_eq!(default_value("int32_t"), "0");
        assert_eq!(default_value("double"), "0.0");
        assert_eq!(default_value("bool"), "false");
        assert_eq!(default_value("cil2cpp::Object*"), "nullptr");
        assert_eq!(default_value("SomeStruct"), "{}");
        assert_eq!(default_value("void"), "");
    }
}
