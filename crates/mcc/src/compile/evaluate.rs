//! statement and expression evaluation
use super::Compile;
use crate::ast::{BinaryOp, Expr, Form, ParamDecl, Statement};
use crate::collector::{Collector, CollectorForm};
use crate::error::{CompileError, Location, Result};
use crate::functions::FunctionKind;
use crate::resource::{Override, Param, Resource, ResourceRef};
use crate::scope::{ScopeId, ScopeKind};
use crate::value::Value;
use indexmap::IndexMap;

/// How a statement list ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Normal,
    Return,
    Next,
    Break,
}

fn statement_location(statement: &Statement) -> Option<&Location> {
    match statement {
        Statement::Assign { location, .. }
        | Statement::Resource { location, .. }
        | Statement::Defaults { location, .. }
        | Statement::Override { location, .. }
        | Statement::Collect { location, .. }
        | Statement::Call { location, .. }
        | Statement::If { location, .. }
        | Statement::Each { location, .. } => Some(location),
        Statement::Return | Statement::Next | Statement::Break => None,
    }
}

impl<'e> Compile<'e> {
    /// Evaluate the body of main, a class, a node or a definition
    pub(super) fn evaluate_body(&mut self, scope: ScopeId, body: &[Statement]) -> Result<()> {
        match self.evaluate_statements(scope, body)? {
            Flow::Normal | Flow::Return => Ok(()),
            Flow::Next => Err(CompileError::evaluation("`next` used outside of `each`")),
            Flow::Break => Err(CompileError::evaluation("`break` used outside of `each`")),
        }
    }

    fn evaluate_statements(&mut self, scope: ScopeId, body: &[Statement]) -> Result<Flow> {
        for statement in body {
            let flow = self
                .evaluate_statement(scope, statement)
                .map_err(|e| e.at(statement_location(statement)))?;
            if flow != Flow::Normal {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn evaluate_statement(&mut self, scope: ScopeId, statement: &Statement) -> Result<Flow> {
        match statement {
            Statement::Assign {
                name,
                value,
                location,
            } => {
                let value = self.evaluate_expr(scope, value)?;
                self.scopes.assign(scope, name, value, Some(location))?;
            }
            Statement::Resource {
                type_name,
                title,
                params,
                form,
                location,
            } => self.evaluate_resource(scope, type_name, title, params, *form, location)?,
            Statement::Defaults {
                type_name, params, ..
            } => {
                let type_name = self
                    .resolve_type(scope, type_name)
                    .map(|(type_name, _)| type_name)
                    .unwrap_or_else(|| type_name.clone());
                let params = self.evaluate_params(scope, params)?;
                self.scopes.set_defaults(scope, &type_name, params)?;
            }
            Statement::Override {
                type_name,
                title,
                params,
                location,
            } => {
                let titles = self.evaluate_titles(scope, title)?;
                let params = self.evaluate_params(scope, params)?;
                let source = self.scopes.get(scope).source.clone();

                for title in titles {
                    let reference = self.canonical_reference(scope, ResourceRef::new(type_name, title));
                    self.store_override(Override::new(
                        reference,
                        params.clone(),
                        source.clone(),
                        scope,
                        Some(location.clone()),
                    ))?;
                }
            }
            Statement::Collect {
                type_name,
                query,
                form,
                params,
                location,
            } => {
                let Some((type_name, _)) = self.resolve_type(scope, type_name) else {
                    return Err(CompileError::name(format!(
                        "Resource type {type_name} doesn't exist"
                    )));
                };
                let query = match query {
                    Some(query) => Some(query.try_map(&mut |expr| self.evaluate_expr(scope, expr))?),
                    None => None,
                };
                let form = match form {
                    Form::Exported => CollectorForm::Exported,
                    Form::Real | Form::Virtual => CollectorForm::Virtual,
                };
                let overrides = self.evaluate_params(scope, params)?;
                let source = self.scopes.get(scope).source.clone();

                self.add_collector(
                    Collector::new(scope, &type_name, query, form, &source, Some(location.clone()))
                        .with_overrides(overrides),
                );
            }
            Statement::Call {
                function,
                args,
                location,
            } => {
                self.call_function(scope, function, args, FunctionKind::Statement, location)?;
            }
            Statement::If {
                condition,
                then,
                otherwise,
                ..
            } => {
                let branch = if self.evaluate_expr(scope, condition)?.is_true() {
                    then
                } else {
                    otherwise
                };
                return self.evaluate_statements(scope, branch);
            }
            Statement::Each {
                names,
                items,
                body,
                location,
            } => return self.evaluate_each(scope, names, items, body, location),
            Statement::Return => return Ok(Flow::Return),
            Statement::Next => return Ok(Flow::Next),
            Statement::Break => return Ok(Flow::Break),
        }

        Ok(Flow::Normal)
    }

    fn evaluate_params(&mut self, scope: ScopeId, params: &[ParamDecl]) -> Result<Vec<Param>> {
        let source = self.scopes.get(scope).source.clone();
        let mut evaluated: Vec<Param> = Vec::with_capacity(params.len());

        for param in params {
            if evaluated.iter().any(|existing| existing.name == param.name) {
                return Err(CompileError::parameter(format!(
                    "Parameter '{}' is already set",
                    param.name
                ))
                .at(Some(&param.location)));
            }

            let value = self
                .evaluate_expr(scope, &param.value)
                .map_err(|e| e.at(Some(&param.location)))?;
            evaluated.push(Param::new(
                param.name.clone(),
                value,
                source.clone(),
                Some(param.location.clone()),
            ));
        }
        Ok(evaluated)
    }

    /// A title expression evaluates to one string or an array of strings
    fn evaluate_titles(&mut self, scope: ScopeId, title: &Expr) -> Result<Vec<String>> {
        self.evaluate_expr(scope, title)?
            .flatten()
            .into_iter()
            .map(|title| match title {
                Value::String(title) if !title.is_empty() => Ok(title),
                Value::String(_) => Err(CompileError::parameter("Resource title must not be empty")),
                other => Err(CompileError::parameter(format!(
                    "Resource titles must be strings, got {}",
                    other.kind()
                ))),
            })
            .collect()
    }

    fn evaluate_resource(
        &mut self,
        scope: ScopeId,
        type_name: &str,
        title: &Expr,
        params: &[ParamDecl],
        form: Form,
        location: &Location,
    ) -> Result<()> {
        let titles = self.evaluate_titles(scope, title)?;
        let params = self.evaluate_params(scope, params)?;

        if type_name == "class" {
            if form != Form::Real {
                return Err(CompileError::evaluation("Classes cannot be virtual or exported"));
            }
            for title in titles {
                self.declare_class(scope, &title, params.clone(), location)?;
            }
            return Ok(());
        }

        let Some((type_name, kind)) = self.resolve_type(scope, type_name) else {
            return Err(CompileError::name(format!("Invalid resource type {type_name}")));
        };
        let source = self.scopes.get(scope).source.clone();
        let container = self.scopes.container(scope);
        let env = self.env;

        for title in titles {
            let mut resource = Resource::new(
                ResourceRef::new(&type_name, title),
                kind.clone(),
                &source,
                scope,
                Some(location.clone()),
            )?;
            resource.container = container;
            resource.virtual_ = form != Form::Real;
            resource.exported = form == Form::Exported;
            for param in &params {
                resource.set(param.clone(), env.types())?;
            }

            self.store_resource(resource)?;
        }
        Ok(())
    }

    /// Resource-like class declaration; a class can be declared this way only once and not after
    /// it was included
    fn declare_class(
        &mut self,
        scope: ScopeId,
        name: &str,
        params: Vec<Param>,
        location: &Location,
    ) -> Result<()> {
        let env = self.env;
        let Some(class) = env.find_class(&self.scopes.namespaces(scope), name) else {
            return Err(CompileError::name(format!("Could not find class {name}")));
        };

        let reference = ResourceRef::class(&class.name);
        if let Some(existing) = self.resource(&reference) {
            let previous = existing
                .location
                .as_ref()
                .map(|location| format!(" (previously declared at {location})"))
                .unwrap_or_default();
            return Err(CompileError::conflict(format!(
                "Duplicate declaration: {reference} is already declared{previous}; cannot redeclare"
            )));
        }

        let source = self.scopes.get(scope).source.clone();
        let container = self.scopes.container(scope);
        self.evaluate_class(class.clone(), &source, container, params, Some(location))?;
        Ok(())
    }

    fn evaluate_each(
        &mut self,
        scope: ScopeId,
        names: &[String],
        items: &Expr,
        body: &[Statement],
        location: &Location,
    ) -> Result<Flow> {
        let pairs = names.len() == 2;
        let iterations: Vec<Vec<Value>> = match self.evaluate_expr(scope, items)? {
            Value::Undef => vec![],
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    if pairs {
                        vec![Value::Integer(index as i64), item]
                    } else {
                        vec![item]
                    }
                })
                .collect(),
            Value::Hash(hash) => hash
                .into_iter()
                .map(|(key, value)| {
                    if pairs {
                        vec![Value::String(key), value]
                    } else {
                        vec![Value::Array(vec![Value::String(key), value])]
                    }
                })
                .collect(),
            other => {
                return Err(CompileError::evaluation(format!(
                    "each expects an array or a hash, got {}",
                    other.kind()
                )))
            }
        };

        let source = self.scopes.get(scope).source.clone();
        for values in iterations {
            let local = self.scopes.new_scope(scope, ScopeKind::Local, &source, "");
            for (name, value) in names.iter().zip(values) {
                self.scopes.assign(local, name, value, Some(location))?;
            }

            match self.evaluate_statements(local, body)? {
                Flow::Normal | Flow::Next => continue,
                Flow::Break => break,
                Flow::Return => return Ok(Flow::Return),
            }
        }

        Ok(Flow::Normal)
    }

    fn call_function(
        &mut self,
        scope: ScopeId,
        name: &str,
        args: &[Expr],
        kind: FunctionKind,
        location: &Location,
    ) -> Result<Value> {
        let call = self.env.functions().resolve(name, kind, args.len())?;
        let args = args
            .iter()
            .map(|arg| self.evaluate_expr(scope, arg))
            .collect::<Result<Vec<_>>>()?;

        tracing::trace!(function = name, ?scope, "call");
        let collectors = self.collectors.len();
        let value = call(self, scope, args)?;

        // collectors registered by the function (`realize`) report the call site
        for collector in self.collectors.iter_mut().skip(collectors) {
            collector.location.get_or_insert_with(|| location.clone());
        }
        Ok(value)
    }

    pub(super) fn evaluate_expr(&mut self, scope: ScopeId, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Interpolated(template) => {
                Ok(Value::String(self.scopes.string_interpolate(scope, template)))
            }
            Expr::Template(parts) => {
                let mut rendered = String::new();
                for part in parts {
                    match part {
                        Expr::Variable(name) => rendered.push_str(&self.scopes.interpolated(scope, name)),
                        part => rendered.push_str(&self.evaluate_expr(scope, part)?.to_string()),
                    }
                }
                Ok(Value::String(rendered))
            }
            Expr::Variable(name) => self.scopes.lookup(scope, name),
            Expr::Reference { type_name, title } => {
                let mut references = self
                    .evaluate_expr(scope, title)?
                    .flatten()
                    .into_iter()
                    .map(|title| match title {
                        Value::String(title) => Ok(Value::Reference(
                            self.canonical_reference(scope, ResourceRef::new(type_name, title)),
                        )),
                        other => Err(CompileError::evaluation(format!(
                            "Resource reference titles must be strings, got {}",
                            other.kind()
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;

                Ok(match references.len() {
                    1 => references.pop().unwrap_or_default(),
                    _ => Value::Array(references),
                })
            }
            Expr::Array(items) => items
                .iter()
                .map(|item| self.evaluate_expr(scope, item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Hash(entries) => {
                let mut hash = IndexMap::new();
                for (key, value) in entries {
                    let key = match self.evaluate_expr(scope, key)? {
                        Value::String(key) => key,
                        other => {
                            return Err(CompileError::evaluation(format!(
                                "Hash keys must be strings, got {}",
                                other.kind()
                            )))
                        }
                    };
                    let value = self.evaluate_expr(scope, value)?;
                    hash.insert(key, value);
                }
                Ok(Value::Hash(hash))
            }
            Expr::Index { target, index } => {
                let target = self.evaluate_expr(scope, target)?;
                let index = self.evaluate_expr(scope, index)?;
                index_value(target, index)
            }
            Expr::Call {
                function,
                args,
                location,
            } => self
                .call_function(scope, function, args, FunctionKind::Rvalue, location)
                .map_err(|e| e.at(Some(location))),
            Expr::Not(inner) => Ok(Value::Boolean(!self.evaluate_expr(scope, inner)?.is_true())),
            Expr::Negate(inner) => match self.evaluate_expr(scope, inner)? {
                Value::Integer(value) => value
                    .checked_neg()
                    .map(Value::Integer)
                    .ok_or_else(|| CompileError::evaluation("Integer overflow")),
                Value::Decimal(value) => Ok(Value::Decimal(-value)),
                other => Err(CompileError::evaluation(format!(
                    "Cannot negate {}",
                    other.kind()
                ))),
            },
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.evaluate_expr(scope, lhs)?;
                match op {
                    BinaryOp::And if !lhs.is_true() => return Ok(Value::Boolean(false)),
                    BinaryOp::Or if lhs.is_true() => return Ok(Value::Boolean(true)),
                    _ => {}
                }
                let rhs = self.evaluate_expr(scope, rhs)?;
                binary(*op, lhs, rhs)
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                if self.evaluate_expr(scope, condition)?.is_true() {
                    self.evaluate_expr(scope, then)
                } else {
                    self.evaluate_expr(scope, otherwise)
                }
            }
        }
    }
}

fn index_value(target: Value, index: Value) -> Result<Value> {
    match (target, index) {
        (Value::Array(items), Value::Integer(index)) => {
            let position = if index < 0 {
                items.len() as i64 + index
            } else {
                index
            };
            Ok(usize::try_from(position)
                .ok()
                .and_then(|position| items.into_iter().nth(position))
                .unwrap_or_default())
        }
        (Value::Hash(hash), Value::String(key)) => Ok(hash.get(&key).cloned().unwrap_or_default()),
        (target, index) => Err(CompileError::evaluation(format!(
            "Cannot index {} with {}",
            target.kind(),
            index.kind()
        ))),
    }
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Eq => "==",
        BinaryOp::NotEq => "!=",
        BinaryOp::Less => "<",
        BinaryOp::LessEq => "<=",
        BinaryOp::Greater => ">",
        BinaryOp::GreaterEq => ">=",
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
    }
}

/// Operators never convert between kinds
fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value> {
    let mismatch = |lhs: &Value, rhs: &Value| {
        CompileError::evaluation(format!(
            "Operator {} is not applicable to {} and {}",
            symbol(op),
            lhs.kind(),
            rhs.kind()
        ))
    };

    Ok(match op {
        BinaryOp::Eq => Value::Boolean(lhs == rhs),
        BinaryOp::NotEq => Value::Boolean(lhs != rhs),
        BinaryOp::And => Value::Boolean(lhs.is_true() && rhs.is_true()),
        BinaryOp::Or => Value::Boolean(lhs.is_true() || rhs.is_true()),
        BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => {
            let ordering = match (&lhs, &rhs) {
                (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
                (Value::Decimal(a), Value::Decimal(b)) => a.partial_cmp(b),
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ => None,
            }
            .ok_or_else(|| mismatch(&lhs, &rhs))?;

            Value::Boolean(match op {
                BinaryOp::Less => ordering.is_lt(),
                BinaryOp::LessEq => ordering.is_le(),
                BinaryOp::Greater => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Integer(a), Value::Integer(b)) => Value::Integer(
                a.checked_add(b)
                    .ok_or_else(|| CompileError::evaluation("Integer overflow"))?,
            ),
            (Value::Decimal(a), Value::Decimal(b)) => Value::Decimal(a + b),
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Value::Array(a)
            }
            (Value::Hash(mut a), Value::Hash(b)) => {
                a.extend(b);
                Value::Hash(a)
            }
            (lhs, rhs) => return Err(mismatch(&lhs, &rhs)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => match (lhs, rhs) {
            (Value::Integer(a), Value::Integer(b)) => {
                let result = match op {
                    BinaryOp::Sub => a.checked_sub(b),
                    BinaryOp::Mul => a.checked_mul(b),
                    BinaryOp::Div => a.checked_div(b),
                    _ => a.checked_rem(b),
                };
                Value::Integer(result.ok_or_else(|| {
                    CompileError::evaluation("Integer overflow or division by zero")
                })?)
            }
            (Value::Decimal(a), Value::Decimal(b)) => Value::Decimal(match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            }),
            (lhs, rhs) => return Err(mismatch(&lhs, &rhs)),
        },
    })
}
