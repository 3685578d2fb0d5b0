use super::{
    lexer::Span,
    parser::{BinOp, Expr, ExprKind, Function, MathFn, Place, Stmt, UnOp, Value, WorkItemFn},
};
use crate::scalar::ScalarType;
use bytemuck::pod_read_unaligned;

/// A runtime fault of a work-item.
#[derive(Debug)]
pub(super) struct Fault {
    pub(super) span: Option<Span>,
    pub(super) message: String,
}

impl Fault {
    fn new(span: Span, message: impl Into<String>) -> Self {
        Self {
            span: Some(span),
            message: message.into(),
        }
    }
}

/// Device memory visible to a launch.
#[derive(Debug)]
pub(super) struct Memory {
    pub(super) bytes: Vec<u8>,
    pub(super) writable: bool,
}

#[derive(Clone, Copy, Debug)]
pub(super) enum LaunchArg {
    /// Index into the launch memory.
    Buffer(usize),
    Scalar(Value),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Grid {
    pub(super) dims: u32,
    pub(super) global: [usize; 3],
    pub(super) local: [usize; 3],
}

pub(super) fn read_value(bytes: &[u8], ty: ScalarType) -> Value {
    use ScalarType::*;
    match ty {
        U8 => Value::I(bytes[0] as i64),
        I8 => Value::I(bytes[0] as i8 as i64),
        U16 => Value::I(pod_read_unaligned::<u16>(bytes) as i64),
        I16 => Value::I(pod_read_unaligned::<i16>(bytes) as i64),
        U32 => Value::I(pod_read_unaligned::<u32>(bytes) as i64),
        I32 => Value::I(pod_read_unaligned::<i32>(bytes) as i64),
        U64 | I64 => Value::I(pod_read_unaligned::<i64>(bytes)),
        F32 => Value::F(pod_read_unaligned::<f32>(bytes) as f64),
        F64 => Value::F(pod_read_unaligned::<f64>(bytes)),
    }
}

fn write_value(bytes: &mut [u8], ty: ScalarType, value: Value) {
    use ScalarType::*;
    let (i, f) = match value {
        Value::I(i) => (i, i as f64),
        Value::F(f) => (f as i64, f),
    };
    match ty {
        U8 | I8 => bytes[0] = i as u8,
        U16 | I16 => bytes.copy_from_slice(&(i as u16).to_ne_bytes()),
        U32 | I32 => bytes.copy_from_slice(&(i as u32).to_ne_bytes()),
        U64 | I64 => bytes.copy_from_slice(&i.to_ne_bytes()),
        F32 => bytes.copy_from_slice(&(f as f32).to_ne_bytes()),
        F64 => bytes.copy_from_slice(&f.to_ne_bytes()),
    }
}

/// Wraps an integer to the width of `ty`, or rounds a float to `ty`.
fn normalize(value: Value, ty: ScalarType) -> Value {
    use ScalarType::*;
    match value {
        Value::I(i) => Value::I(match ty {
            U8 => i as u8 as i64,
            I8 => i as i8 as i64,
            U16 => i as u16 as i64,
            I16 => i as i16 as i64,
            U32 => i as u32 as i64,
            I32 => i as i32 as i64,
            _ => i,
        }),
        Value::F(f) if ty == F32 => Value::F(f as f32 as f64),
        value => value,
    }
}

pub(super) fn cast(value: Value, from: ScalarType, to: ScalarType) -> Value {
    match (value, to.is_float()) {
        (Value::I(i), true) => {
            let f = if from == ScalarType::U64 {
                i as u64 as f64
            } else {
                i as f64
            };
            normalize(Value::F(f), to)
        }
        (Value::F(f), false) => {
            let i = if to == ScalarType::U64 {
                f as u64 as i64
            } else {
                f as i64
            };
            normalize(Value::I(i), to)
        }
        (value, _) => normalize(value, to),
    }
}

fn truthy(value: Value) -> bool {
    match value {
        Value::I(i) => i != 0,
        Value::F(f) => f != 0.,
    }
}

fn bool_value(b: bool) -> Value {
    Value::I(b as i64)
}

fn compare(a: Value, b: Value, ty: ScalarType) -> std::cmp::Ordering {
    match (a, b) {
        (Value::I(a), Value::I(b)) if ty == ScalarType::U64 => (a as u64).cmp(&(b as u64)),
        (Value::I(a), Value::I(b)) => a.cmp(&b),
        (Value::F(a), Value::F(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
        (a, b) => as_f64(a).partial_cmp(&as_f64(b)).unwrap_or(std::cmp::Ordering::Equal),
    }
}

fn as_f64(value: Value) -> f64 {
    match value {
        Value::I(i) => i as f64,
        Value::F(f) => f,
    }
}

fn binary(op: BinOp, a: Value, b: Value, ty: ScalarType, span: Span) -> Result<Value, Fault> {
    use BinOp::*;
    if op == Eq || op == Ne {
        let equal = match (a, b) {
            (Value::F(a), Value::F(b)) => a == b,
            (a, b) => compare(a, b, ty).is_eq(),
        };
        return Ok(bool_value(equal == (op == Eq)));
    }
    if matches!(op, Lt | Le | Gt | Ge) {
        if let (Value::F(x), Value::F(y)) = (a, b) {
            if x.is_nan() || y.is_nan() {
                return Ok(bool_value(false));
            }
        }
        let ord = compare(a, b, ty);
        let result = match op {
            Lt => ord.is_lt(),
            Le => ord.is_le(),
            Gt => ord.is_gt(),
            _ => ord.is_ge(),
        };
        return Ok(bool_value(result));
    }
    let value = match (a, b) {
        (Value::F(a), Value::F(b)) => Value::F(match op {
            Add => a + b,
            Sub => a - b,
            Mul => a * b,
            Div => a / b,
            _ => return Err(Fault::new(span, "invalid floating point operation")),
        }),
        (Value::I(a), Value::I(b)) => {
            let unsigned64 = ty == ScalarType::U64;
            let bits = ty.size() as u32 * 8;
            Value::I(match op {
                Add => a.wrapping_add(b),
                Sub => a.wrapping_sub(b),
                Mul => a.wrapping_mul(b),
                Div | Rem if b == 0 => return Err(Fault::new(span, "integer division by zero")),
                Div if unsigned64 => ((a as u64) / (b as u64)) as i64,
                Rem if unsigned64 => ((a as u64) % (b as u64)) as i64,
                Div => a.wrapping_div(b),
                Rem => a.wrapping_rem(b),
                Shl => a.wrapping_shl(b as u32 & (bits - 1)),
                Shr if unsigned64 => ((a as u64) >> (b as u32 & (bits - 1))) as i64,
                Shr => a >> (b as u32 & (bits - 1)),
                BitAnd => a & b,
                BitOr => a | b,
                BitXor => a ^ b,
                Eq | Ne | Lt | Le | Gt | Ge => return Ok(bool_value(false)),
            })
        }
        (a, b) => {
            return Err(Fault::new(
                span,
                format!("mismatched operands {a:?} and {b:?}"),
            ))
        }
    };
    Ok(normalize(value, ty))
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return,
}

#[derive(Clone, Copy)]
struct Item {
    global_id: [usize; 3],
    local_id: [usize; 3],
    group_id: [usize; 3],
}

struct Exec<'a> {
    function: &'a Function,
    /// Memory index of each buffer parameter.
    bindings: Vec<usize>,
    memory: &'a mut [Memory],
    grid: Grid,
    item: Item,
    frame: Vec<Value>,
}

/// Runs `function` over every work-item of `grid`.
pub(super) fn run(
    function: &Function,
    args: &[LaunchArg],
    memory: &mut [Memory],
    grid: Grid,
) -> Result<(), Fault> {
    use super::parser::ParamDeclKind;
    let mut bindings = vec![0; function.buffers];
    let mut params = Vec::new();
    for (param, arg) in function.params.iter().zip(args) {
        match (param.kind, arg) {
            (ParamDeclKind::Buffer { buffer, .. }, LaunchArg::Buffer(index)) => {
                bindings[buffer] = *index;
            }
            (ParamDeclKind::Scalar { slot, ty }, LaunchArg::Scalar(value)) => {
                params.push((slot, normalize(*value, ty)));
            }
            _ => {
                return Err(Fault {
                    span: None,
                    message: format!("argument `{}` has the wrong kind", param.name),
                })
            }
        }
    }
    let mut exec = Exec {
        function,
        bindings,
        memory,
        grid,
        item: Item {
            global_id: [0; 3],
            local_id: [0; 3],
            group_id: [0; 3],
        },
        frame: Vec::new(),
    };
    let groups: [usize; 3] = std::array::from_fn(|i| grid.global[i] / grid.local[i].max(1));
    for gz in 0..groups[2] {
        for gy in 0..groups[1] {
            for gx in 0..groups[0] {
                let group_id = [gx, gy, gz];
                for lz in 0..grid.local[2] {
                    for ly in 0..grid.local[1] {
                        for lx in 0..grid.local[0] {
                            let local_id = [lx, ly, lz];
                            let global_id =
                                std::array::from_fn(|i| group_id[i] * grid.local[i] + local_id[i]);
                            exec.item = Item {
                                global_id,
                                local_id,
                                group_id,
                            };
                            exec.frame.clear();
                            exec.frame.resize(function.frame_size, Value::I(0));
                            for (slot, value) in params.iter().copied() {
                                exec.frame[slot] = value;
                            }
                            exec.block(&function.body)?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

impl Exec<'_> {
    fn block(&mut self, stmts: &[Stmt]) -> Result<Flow, Fault> {
        for stmt in stmts {
            match self.stmt(stmt)? {
                Flow::Normal => (),
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<Flow, Fault> {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
            Stmt::Decl { slot, ty, init } => {
                let value = match init {
                    Some(init) => self.eval(init)?,
                    None if ty.is_float() => Value::F(0.),
                    None => Value::I(0),
                };
                self.frame[*slot] = value;
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if truthy(self.eval(cond)?) {
                    return self.stmt(then);
                } else if let Some(otherwise) = otherwise {
                    return self.stmt(otherwise);
                }
            }
            Stmt::While { cond, body } => {
                while truthy(self.eval(cond)?) {
                    match self.stmt(body)? {
                        Flow::Break => break,
                        Flow::Return => return Ok(Flow::Return),
                        _ => (),
                    }
                }
            }
            Stmt::DoWhile { body, cond } => loop {
                match self.stmt(body)? {
                    Flow::Break => break,
                    Flow::Return => return Ok(Flow::Return),
                    _ => (),
                }
                if !truthy(self.eval(cond)?) {
                    break;
                }
            },
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                loop {
                    if let Some(cond) = cond {
                        if !truthy(self.eval(cond)?) {
                            break;
                        }
                    }
                    match self.stmt(body)? {
                        Flow::Break => break,
                        Flow::Return => return Ok(Flow::Return),
                        _ => (),
                    }
                    if let Some(step) = step {
                        self.eval(step)?;
                    }
                }
            }
            Stmt::Block(stmts) => return self.block(stmts),
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Return => return Ok(Flow::Return),
        }
        Ok(Flow::Normal)
    }

    fn element(&self, buffer: usize, index: i64, ty: ScalarType, span: Span) -> Result<(usize, usize), Fault> {
        let memory = self.bindings[buffer];
        let len = self.memory[memory].bytes.len() / ty.size();
        if index < 0 || index as u64 >= len as u64 {
            let name = self
                .function
                .params
                .iter()
                .find(|param| {
                    matches!(param.kind, super::parser::ParamDeclKind::Buffer { buffer: b, .. } if b == buffer)
                })
                .map_or("", |param| param.name.as_str());
            return Err(Fault::new(
                span,
                format!(
                    "index {index} is out of bounds for '{name}' of {len} elements (work-item {:?})",
                    self.item.global_id
                ),
            ));
        }
        Ok((memory, index as usize * ty.size()))
    }

    fn load(&self, place: &ResolvedPlace, ty: ScalarType) -> Value {
        match *place {
            ResolvedPlace::Local(slot) => self.frame[slot],
            ResolvedPlace::Elem { memory, offset } => {
                read_value(&self.memory[memory].bytes[offset..offset + ty.size()], ty)
            }
        }
    }

    fn store(
        &mut self,
        place: &ResolvedPlace,
        ty: ScalarType,
        value: Value,
        span: Span,
    ) -> Result<(), Fault> {
        match *place {
            ResolvedPlace::Local(slot) => self.frame[slot] = value,
            ResolvedPlace::Elem { memory, offset } => {
                let memory = &mut self.memory[memory];
                if !memory.writable {
                    return Err(Fault::new(span, "write to a read-only buffer"));
                }
                write_value(&mut memory.bytes[offset..offset + ty.size()], ty, value);
            }
        }
        Ok(())
    }

    fn resolve(&mut self, place: &Place, ty: ScalarType, span: Span) -> Result<ResolvedPlace, Fault> {
        match place {
            Place::Local(slot) => Ok(ResolvedPlace::Local(*slot)),
            Place::Elem { buffer, index } => {
                let index = self.eval_int(index)?;
                let (memory, offset) = self.element(*buffer, index, ty, span)?;
                Ok(ResolvedPlace::Elem { memory, offset })
            }
        }
    }

    fn eval_int(&mut self, expr: &Expr) -> Result<i64, Fault> {
        match self.eval(expr)? {
            Value::I(i) => Ok(i),
            Value::F(f) => Ok(f as i64),
        }
    }

    fn work_item(&self, f: WorkItemFn, dim: usize) -> usize {
        use WorkItemFn::*;
        let grid = &self.grid;
        if dim >= grid.dims as usize {
            return match f {
                GlobalId | LocalId | GroupId => 0,
                GlobalSize | LocalSize | NumGroups => 1,
            };
        }
        match f {
            GlobalId => self.item.global_id[dim],
            LocalId => self.item.local_id[dim],
            GroupId => self.item.group_id[dim],
            GlobalSize => grid.global[dim],
            LocalSize => grid.local[dim],
            NumGroups => grid.global[dim] / grid.local[dim].max(1),
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, Fault> {
        let ty = expr.ty;
        let value = match &expr.kind {
            ExprKind::Const(value) => normalize(*value, ty),
            ExprKind::Local(slot) => self.frame[*slot],
            ExprKind::Load { buffer, index } => {
                let index = self.eval_int(index)?;
                let (memory, offset) = self.element(*buffer, index, ty, expr.span)?;
                self.load(&ResolvedPlace::Elem { memory, offset }, ty)
            }
            ExprKind::Unary(op, operand) => {
                let value = self.eval(operand)?;
                match (op, value) {
                    (UnOp::Not, value) => bool_value(!truthy(value)),
                    (UnOp::Neg, Value::I(i)) => normalize(Value::I(i.wrapping_neg()), ty),
                    (UnOp::Neg, Value::F(f)) => normalize(Value::F(-f), ty),
                    (UnOp::BitNot, Value::I(i)) => normalize(Value::I(!i), ty),
                    (UnOp::BitNot, value) => value,
                }
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let a = self.eval(lhs)?;
                let b = self.eval(rhs)?;
                binary(*op, a, b, lhs.ty, expr.span)?
            }
            ExprKind::Logical { and, lhs, rhs } => {
                let lhs = truthy(self.eval(lhs)?);
                let result = if *and {
                    lhs && truthy(self.eval(rhs)?)
                } else {
                    lhs || truthy(self.eval(rhs)?)
                };
                bool_value(result)
            }
            ExprKind::Ternary(cond, a, b) => {
                if truthy(self.eval(cond)?) {
                    self.eval(a)?
                } else {
                    self.eval(b)?
                }
            }
            ExprKind::Convert(inner) => {
                let value = self.eval(inner)?;
                cast(value, inner.ty, ty)
            }
            ExprKind::WorkItem(f, dim) => {
                let dim = self.eval_int(dim)?;
                Value::I(self.work_item(*f, dim as usize) as i64)
            }
            ExprKind::WorkDim => Value::I(self.grid.dims as i64),
            ExprKind::Math(f, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                match (f, values.as_slice()) {
                    (MathFn::Min, [a, b]) => {
                        if compare(*a, *b, ty).is_le() {
                            *a
                        } else {
                            *b
                        }
                    }
                    (MathFn::Max, [a, b]) => {
                        if compare(*a, *b, ty).is_ge() {
                            *a
                        } else {
                            *b
                        }
                    }
                    (MathFn::Abs, [Value::I(i)]) if ty.is_signed() => {
                        normalize(Value::I(i.wrapping_abs()), ty)
                    }
                    (MathFn::Abs, [Value::F(f)]) => Value::F(f.abs()),
                    (MathFn::Abs, [value]) => *value,
                    _ => return Err(Fault::new(expr.span, "wrong number of arguments")),
                }
            }
            ExprKind::Assign { place, op, value } => {
                let place = self.resolve(place, ty, expr.span)?;
                let rhs = self.eval(value)?;
                let result = match op {
                    None => rhs,
                    Some((op, op_ty)) => {
                        let current = cast(self.load(&place, ty), ty, *op_ty);
                        let result = binary(*op, current, rhs, *op_ty, expr.span)?;
                        cast(result, *op_ty, ty)
                    }
                };
                self.store(&place, ty, result, expr.span)?;
                result
            }
            ExprKind::Step { place, delta, post } => {
                let place = self.resolve(place, ty, expr.span)?;
                let old = self.load(&place, ty);
                let new = match old {
                    Value::I(i) => normalize(Value::I(i.wrapping_add(*delta)), ty),
                    Value::F(f) => normalize(Value::F(f + *delta as f64), ty),
                };
                self.store(&place, ty, new, expr.span)?;
                if *post {
                    old
                } else {
                    new
                }
            }
        };
        Ok(value)
    }
}

enum ResolvedPlace {
    Local(usize),
    Elem { memory: usize, offset: usize },
}

#[cfg(test)]
mod tests {
    use super::super::{lexer::tokenize, parser::parse};
    use super::*;

    fn launch(source: &str, args: &[LaunchArg], memory: &mut [Memory], global: usize) -> Result<(), Fault> {
        let mut diagnostics = Vec::new();
        let tokens = tokenize(source, &mut diagnostics);
        let module = parse(tokens, &mut diagnostics);
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        let grid = Grid {
            dims: 1,
            global: [global, 1, 1],
            local: [1, 1, 1],
        };
        run(&module.kernels[0], args, memory, grid)
    }

    fn ints(values: &[i32]) -> Memory {
        Memory {
            bytes: bytemuck::cast_slice(values).to_vec(),
            writable: true,
        }
    }

    fn as_ints(memory: &Memory) -> Vec<i32> {
        memory
            .bytes
            .chunks_exact(4)
            .map(pod_read_unaligned::<i32>)
            .collect()
    }

    #[test]
    fn integer_arithmetic_wraps() {
        assert_eq!(
            binary(BinOp::Mul, Value::I(2_000_000_000), Value::I(2), ScalarType::I32, Span::default())
                .unwrap(),
            Value::I(-294_967_296)
        );
        assert_eq!(
            binary(BinOp::Sub, Value::I(0), Value::I(1), ScalarType::U32, Span::default()).unwrap(),
            Value::I(u32::MAX as i64)
        );
        assert_eq!(
            binary(BinOp::Shl, Value::I(1), Value::I(33), ScalarType::I32, Span::default()).unwrap(),
            Value::I(2)
        );
        assert!(
            binary(BinOp::Div, Value::I(1), Value::I(0), ScalarType::I32, Span::default()).is_err()
        );
    }

    #[test]
    fn unsigned_64_bit_compare() {
        let big = Value::I(-1); // u64::MAX
        assert_eq!(
            binary(BinOp::Gt, big, Value::I(1), ScalarType::U64, Span::default()).unwrap(),
            Value::I(1)
        );
        assert_eq!(cast(big, ScalarType::U64, ScalarType::F64), Value::F(u64::MAX as f64));
    }

    #[test]
    fn cube_kernel() {
        let source = "__kernel void cube(__global int* input, __global int* output, const unsigned int count) {
            int i = get_global_id(0);
            if (i < count)
                output[i] = input[i] * input[i] * input[i];
        }";
        let mut memory = [ints(&[2, 5, 9, 0]), ints(&[0; 4])];
        launch(
            source,
            &[LaunchArg::Buffer(0), LaunchArg::Buffer(1), LaunchArg::Scalar(Value::I(3))],
            &mut memory,
            4,
        )
        .unwrap();
        assert_eq!(as_ints(&memory[1]), [8, 125, 729, 0]);
    }

    #[test]
    fn loops_and_compound_assignment() {
        let source = "__kernel void sum(__global int* out) {
            int acc = 0;
            for (int j = 0; j < 10; j++) {
                if (j % 2) continue;
                acc += j;
            }
            unsigned int k = 0;
            while (1) { if (++k == 3) break; }
            out[get_global_id(0)] = acc * 10 + k;
        }";
        let mut memory = [ints(&[0; 2])];
        launch(source, &[LaunchArg::Buffer(0)], &mut memory, 2).unwrap();
        assert_eq!(as_ints(&memory[0]), [203, 203]);
    }

    #[test]
    fn out_of_bounds_access_faults() {
        let source = "__kernel void f(__global int* out) { out[get_global_id(0) + 1] = 1; }";
        let mut memory = [ints(&[0; 2])];
        let fault = launch(source, &[LaunchArg::Buffer(0)], &mut memory, 2).unwrap_err();
        assert!(fault.message.contains("out of bounds"), "{}", fault.message);
        assert_eq!(fault.span.unwrap().line, 1);
    }

    #[test]
    fn writes_to_read_only_memory_fault() {
        let source = "__kernel void f(__global int* out) { out[0] = 1; }";
        let mut memory = [Memory {
            bytes: vec![0; 4],
            writable: false,
        }];
        assert!(launch(source, &[LaunchArg::Buffer(0)], &mut memory, 1).is_err());
    }
}
