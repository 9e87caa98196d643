//! lowering of HCL documents into a [Manifest]
//!
//! Every block identifier is a statement keyword or, failing that, a resource type:
//!
//! ```hcl
//! class base {
//!   virtual file "/tmp/f" { owner = "root" }
//! }
//!
//! class sub inherits base {
//!   collect file {
//!     where = title == "/tmp/f"
//!     owner = "bin"
//!   }
//! }
//!
//! include = "sub"
//! ```
//!
//! Attributes are variable assignments unless the key names a statement function (`include`,
//! `realize`, ...), in which case the value is the argument list.
//!
//! All issues of all documents are collected before giving up, see [ManifestErrors].
use crate::ast::{
    BinaryOp, ClassDef, CompareOp, DefineDef, Expr, Form, Manifest, NodeDef, ParamDecl, Parameter,
    Query, Statement,
};
use crate::error::Location;
use crate::functions::FunctionRegistry;
use crate::hcl_documents::{Document, HclDocuments};
use crate::resource::normalize_name;
use crate::value::Value;
use hcl::expr::{BinaryOperator, ObjectKey, Operation, TemplateExpr, TraversalOperator, UnaryOperator};
use hcl::template::Element;
use hcl_edit::repr::Span;
use hcl_edit::structure::{Attribute, Block, Body, Structure};
use indexmap::IndexMap;
use std::sync::Arc;

/// Lower all documents, in insertion order, into one manifest
pub fn lower(
    documents: &HclDocuments,
    functions: &FunctionRegistry,
) -> Result<Manifest, ManifestErrors> {
    let mut lowerer = Lowerer {
        functions,
        manifest: Manifest::default(),
        definitions: Default::default(),
        errors: ManifestErrors::new(),
    };

    for (_, document) in documents.iter() {
        let statements = lowerer.body(document, &document.body, Context::Main);
        lowerer.manifest.main.extend(statements);
    }

    if !lowerer.errors.issues.is_empty() {
        return Err(lowerer.errors);
    }

    tracing::debug!(
        classes = lowerer.manifest.classes.len(),
        defines = lowerer.manifest.defines.len(),
        nodes = lowerer.manifest.nodes.len(),
        "manifest lowered"
    );
    Ok(lowerer.manifest)
}

/// What a body may contain besides plain code
#[derive(Debug, Clone, Copy)]
enum Context<'n> {
    /// Top level: classes, defines and nodes
    Main,
    /// Class body: nested classes and defines, qualified with the namespace
    Class(&'n str),
    /// Any other body: code only
    Code,
}

impl<'n> Context<'n> {
    fn namespace(&self) -> &str {
        match self {
            Context::Class(namespace) => namespace,
            _ => "",
        }
    }

    fn allows_definitions(&self) -> bool {
        !matches!(self, Context::Code)
    }
}

struct Lowerer<'f> {
    functions: &'f FunctionRegistry,
    manifest: Manifest,
    /// where each class, define and node was defined
    definitions: IndexMap<(&'static str, String), Location>,
    errors: ManifestErrors,
}

fn attributes(body: &Body) -> impl Iterator<Item = &Attribute> {
    body.iter().filter_map(|structure| match structure {
        Structure::Attribute(attribute) => Some(attribute),
        Structure::Block(_) => None,
    })
}

fn blocks(body: &Body) -> impl Iterator<Item = &Block> {
    body.iter().filter_map(|structure| match structure {
        Structure::Block(block) => Some(block),
        Structure::Attribute(_) => None,
    })
}

fn location_of(document: &Document, spanned: &impl Span) -> Location {
    document.location(spanned.span().map(|range| range.start).unwrap_or(0))
}

impl<'f> Lowerer<'f> {
    fn body(&mut self, document: &Document, body: &Body, context: Context) -> Vec<Statement> {
        let mut statements = vec![];
        for structure in body.iter() {
            let statement = match structure {
                Structure::Attribute(attribute) => self.attribute(document, attribute),
                Structure::Block(block) => self.block(document, block, context),
            };
            statements.extend(statement);
        }
        statements
    }

    fn attribute(&mut self, document: &Document, attribute: &Attribute) -> Option<Statement> {
        let location = location_of(document, attribute);
        let key = attribute.key.value().as_str();
        let value: hcl::Expression = attribute.value.clone().into();

        if self.functions.is_statement(key) {
            let args = match value {
                hcl::Expression::Array(items) => items,
                other => vec![other],
            };
            let args = args
                .into_iter()
                .map(|arg| self.expr(arg, &location))
                .collect::<Option<Vec<_>>>()?;

            return Some(Statement::Call {
                function: key.to_string(),
                args,
                location,
            });
        }

        Some(Statement::Assign {
            name: key.to_string(),
            value: self.expr(value, &location)?,
            location,
        })
    }

    fn block(&mut self, document: &Document, block: &Block, context: Context) -> Option<Statement> {
        let location = location_of(document, block);
        let ident = block.ident.value().as_str();
        let labels: Vec<&str> = block.labels.iter().map(|label| label.as_str()).collect();

        match ident {
            "class" | "define" | "node" => {
                if !context.allows_definitions() || (ident == "node" && !matches!(context, Context::Main)) {
                    self.errors.log(Issue::NestedDefinition {
                        keyword: ident.to_string(),
                        location,
                    });
                    return None;
                }

                match ident {
                    "class" => self.class(document, block, &labels, context, location),
                    "define" => self.define(document, block, &labels, context, location),
                    _ => self.node(document, block, &labels, location),
                }
                None
            }
            "resource" => {
                let (type_name, title) = self.type_and_title(ident, &labels, &location)?;
                self.resource(document, block, type_name, title, Form::Real, location)
            }
            "virtual" | "exported" => {
                let form = if ident == "virtual" {
                    Form::Virtual
                } else {
                    Form::Exported
                };
                let (type_name, title) = self.type_and_title(ident, &labels, &location)?;
                self.resource(document, block, type_name, title, form, location)
            }
            "defaults" => {
                let [type_name] = labels.as_slice() else {
                    self.errors.log(Issue::LabelCount {
                        keyword: ident.to_string(),
                        expected: "a resource type",
                        location,
                    });
                    return None;
                };
                let params = self.params_only(document, block, ident)?;
                Some(Statement::Defaults {
                    type_name: normalize_name(type_name),
                    params,
                    location,
                })
            }
            "override" => {
                let [type_name, title] = labels.as_slice() else {
                    self.errors.log(Issue::LabelCount {
                        keyword: ident.to_string(),
                        expected: "a resource type and a title",
                        location,
                    });
                    return None;
                };
                let params = self.params_only(document, block, ident)?;
                Some(Statement::Override {
                    type_name: normalize_name(type_name),
                    title: string_expr(title.to_string()),
                    params,
                    location,
                })
            }
            "collect" => self.collect(document, block, &labels, location),
            "if" => self.conditional(document, block, location),
            "each" => self.each(document, block, &labels, location),
            "return" | "next" | "break" => {
                if !labels.is_empty() || block.body.iter().next().is_some() {
                    self.errors.log(Issue::NotEmpty {
                        keyword: ident.to_string(),
                        location,
                    });
                    return None;
                }
                Some(match ident {
                    "return" => Statement::Return,
                    "next" => Statement::Next,
                    _ => Statement::Break,
                })
            }
            "params" | "then" | "else" => {
                self.errors.log(Issue::Misplaced {
                    keyword: ident.to_string(),
                    location,
                });
                None
            }
            type_name => {
                let title = match labels.as_slice() {
                    [] => None,
                    [title] => Some(*title),
                    _ => {
                        self.errors.log(Issue::LabelCount {
                            keyword: type_name.to_string(),
                            expected: "at most one title",
                            location,
                        });
                        return None;
                    }
                };
                self.resource(document, block, type_name, title, Form::Real, location)
            }
        }
    }

    fn type_and_title<'l>(
        &mut self,
        keyword: &str,
        labels: &[&'l str],
        location: &Location,
    ) -> Option<(&'l str, Option<&'l str>)> {
        match labels {
            [type_name] => Some((type_name, None)),
            [type_name, title] => Some((type_name, Some(title))),
            _ => {
                self.errors.log(Issue::LabelCount {
                    keyword: keyword.to_string(),
                    expected: "a resource type and optionally a title",
                    location: location.clone(),
                });
                None
            }
        }
    }

    fn resource(
        &mut self,
        document: &Document,
        block: &Block,
        type_name: &str,
        title: Option<&str>,
        form: Form,
        location: Location,
    ) -> Option<Statement> {
        let mut title = title.map(|title| string_expr(title.to_string()));
        let mut params = vec![];

        for structure in block.body.iter() {
            match structure {
                Structure::Attribute(attribute) if attribute.key.value().as_str() == "title" => {
                    let attribute_location = location_of(document, attribute);
                    if title.is_some() {
                        self.errors.log(Issue::DuplicateTitle {
                            location: attribute_location,
                        });
                        return None;
                    }
                    title = Some(self.expr(attribute.value.clone().into(), &attribute_location)?);
                }
                Structure::Attribute(attribute) => params.push(self.param(document, attribute)?),
                Structure::Block(nested) => {
                    self.errors.log(Issue::Misplaced {
                        keyword: nested.ident.value().to_string(),
                        location: location_of(document, nested),
                    });
                    return None;
                }
            }
        }

        let Some(title) = title else {
            self.errors.log(Issue::MissingTitle { location });
            return None;
        };

        Some(Statement::Resource {
            type_name: normalize_name(type_name),
            title,
            params,
            form,
            location,
        })
    }

    fn param(&mut self, document: &Document, attribute: &Attribute) -> Option<ParamDecl> {
        let location = location_of(document, attribute);
        Some(ParamDecl {
            name: attribute.key.value().to_string(),
            value: self.expr(attribute.value.clone().into(), &location)?,
            location,
        })
    }

    /// Body consisting of parameter attributes only
    fn params_only(&mut self, document: &Document, block: &Block, keyword: &str) -> Option<Vec<ParamDecl>> {
        if let Some(nested) = blocks(&block.body).next() {
            self.errors.log(Issue::Misplaced {
                keyword: format!("{} (inside {keyword})", nested.ident.value()),
                location: location_of(document, nested),
            });
            return None;
        }

        attributes(&block.body)
            .map(|attribute| self.param(document, attribute))
            .collect()
    }

    /// Splits `name [inherits parent]` labels
    fn name_and_parent<'l>(
        &mut self,
        keyword: &str,
        labels: &[&'l str],
        location: &Location,
    ) -> Option<(Vec<&'l str>, Option<&'l str>)> {
        let (names, parent) = match labels {
            [names @ .., "inherits", parent] => (names.to_vec(), Some(*parent)),
            names => (names.to_vec(), None),
        };

        if names.is_empty() || (keyword != "node" && names.len() > 1) {
            self.errors.log(Issue::LabelCount {
                keyword: keyword.to_string(),
                expected: "a name, optionally followed by `inherits <parent>`",
                location: location.clone(),
            });
            return None;
        }

        Some((names, parent))
    }

    fn define_once(&mut self, kind: &'static str, name: &str, location: &Location) -> bool {
        if let Some(existing) = self.definitions.get(&(kind, name.to_string())) {
            self.errors.log(Issue::DuplicateDefinition {
                kind,
                name: name.to_string(),
                existing: existing.clone(),
                location: location.clone(),
            });
            return false;
        }

        self.definitions
            .insert((kind, name.to_string()), location.clone());
        true
    }

    fn qualified(context: Context, name: &str) -> String {
        let name = normalize_name(name);
        match context.namespace() {
            "" => name,
            namespace => format!("{namespace}::{name}"),
        }
    }

    /// Formal parameters (from `params` blocks) and the remaining body
    fn signature_and_body(
        &mut self,
        document: &Document,
        block: &Block,
        context: Context,
    ) -> (Vec<Parameter>, Vec<Statement>) {
        let mut parameters = vec![];
        let mut body = vec![];

        for structure in block.body.iter() {
            match structure {
                Structure::Block(params) if params.ident.value().as_str() == "params" => {
                    for attribute in attributes(&params.body) {
                        let location = location_of(document, attribute);
                        let default = match hcl::Expression::from(attribute.value.clone()) {
                            hcl::Expression::Null => None,
                            expr => self.expr(expr, &location),
                        };
                        parameters.push(Parameter {
                            name: attribute.key.value().to_string(),
                            default,
                        });
                    }
                }
                Structure::Block(nested) => body.extend(self.block(document, nested, context)),
                Structure::Attribute(attribute) => body.extend(self.attribute(document, attribute)),
            }
        }

        (parameters, body)
    }

    fn class(
        &mut self,
        document: &Document,
        block: &Block,
        labels: &[&str],
        context: Context,
        location: Location,
    ) {
        let Some((names, parent)) = self.name_and_parent("class", labels, &location) else {
            return;
        };
        let name = Self::qualified(context, names[0]);
        if name == "main" {
            self.errors.log(Issue::ReservedName { name, location });
            return;
        }
        if !self.define_once("class", &name, &location) {
            return;
        }

        let (parameters, body) = self.signature_and_body(document, block, Context::Class(&name));
        self.manifest.classes.insert(
            name.clone(),
            Arc::new(ClassDef {
                name,
                parent: parent.map(normalize_name),
                parameters,
                body,
                location,
            }),
        );
    }

    fn define(
        &mut self,
        document: &Document,
        block: &Block,
        labels: &[&str],
        context: Context,
        location: Location,
    ) {
        let [name] = labels else {
            self.errors.log(Issue::LabelCount {
                keyword: "define".to_string(),
                expected: "a name",
                location,
            });
            return;
        };
        let name = Self::qualified(context, name);
        if !self.define_once("define", &name, &location) {
            return;
        }

        let (parameters, body) = self.signature_and_body(document, block, Context::Code);
        self.manifest.defines.insert(
            name.clone(),
            Arc::new(DefineDef {
                name,
                parameters,
                body,
                location,
            }),
        );
    }

    fn node(&mut self, document: &Document, block: &Block, labels: &[&str], location: Location) {
        let Some((names, parent)) = self.name_and_parent("node", labels, &location) else {
            return;
        };
        let names: Vec<String> = names.into_iter().map(|name| name.to_lowercase()).collect();
        for name in &names {
            if !self.define_once("node", name, &location) {
                return;
            }
        }

        let body = self.body(document, &block.body, Context::Code);
        self.manifest.nodes.push(Arc::new(NodeDef {
            names,
            parent: parent.map(str::to_lowercase),
            body,
            location,
        }));
    }

    fn collect(
        &mut self,
        document: &Document,
        block: &Block,
        labels: &[&str],
        location: Location,
    ) -> Option<Statement> {
        let (form, type_name) = match labels {
            [type_name] => (Form::Virtual, *type_name),
            ["virtual", type_name] => (Form::Virtual, *type_name),
            ["exported", type_name] => (Form::Exported, *type_name),
            _ => {
                self.errors.log(Issue::LabelCount {
                    keyword: "collect".to_string(),
                    expected: "a resource type, optionally preceded by `virtual` or `exported`",
                    location,
                });
                return None;
            }
        };

        let mut query = None;
        let mut params = vec![];
        for structure in block.body.iter() {
            match structure {
                Structure::Attribute(attribute) if attribute.key.value().as_str() == "where" => {
                    let attribute_location = location_of(document, attribute);
                    match lower_query(attribute.value.clone().into(), &attribute_location) {
                        Ok(lowered) => query = Some(lowered),
                        Err(message) => {
                            self.errors.log(Issue::InvalidExpression {
                                message,
                                location: attribute_location,
                            });
                            return None;
                        }
                    }
                }
                Structure::Attribute(attribute) => params.push(self.param(document, attribute)?),
                Structure::Block(nested) => {
                    self.errors.log(Issue::Misplaced {
                        keyword: nested.ident.value().to_string(),
                        location: location_of(document, nested),
                    });
                    return None;
                }
            }
        }

        Some(Statement::Collect {
            type_name: normalize_name(type_name),
            query,
            form,
            params,
            location,
        })
    }

    fn conditional(&mut self, document: &Document, block: &Block, location: Location) -> Option<Statement> {
        let mut condition = None;
        let mut then = vec![];
        let mut otherwise = vec![];

        for structure in block.body.iter() {
            match structure {
                Structure::Attribute(attribute) if attribute.key.value().as_str() == "condition" => {
                    let attribute_location = location_of(document, attribute);
                    condition = Some(self.expr(attribute.value.clone().into(), &attribute_location)?);
                }
                Structure::Block(branch) if branch.ident.value().as_str() == "then" => {
                    then = self.body(document, &branch.body, Context::Code);
                }
                Structure::Block(branch) if branch.ident.value().as_str() == "else" => {
                    otherwise = self.body(document, &branch.body, Context::Code);
                }
                Structure::Attribute(attribute) => {
                    self.errors.log(Issue::Misplaced {
                        keyword: attribute.key.value().to_string(),
                        location: location_of(document, attribute),
                    });
                    return None;
                }
                Structure::Block(nested) => {
                    self.errors.log(Issue::Misplaced {
                        keyword: nested.ident.value().to_string(),
                        location: location_of(document, nested),
                    });
                    return None;
                }
            }
        }

        let Some(condition) = condition else {
            self.errors.log(Issue::MissingAttribute {
                keyword: "if".to_string(),
                attribute: "condition",
                location,
            });
            return None;
        };

        Some(Statement::If {
            condition,
            then,
            otherwise,
            location,
        })
    }

    fn each(&mut self, document: &Document, block: &Block, labels: &[&str], location: Location) -> Option<Statement> {
        if labels.is_empty() || labels.len() > 2 {
            self.errors.log(Issue::LabelCount {
                keyword: "each".to_string(),
                expected: "one or two variable names",
                location,
            });
            return None;
        }

        let mut items = None;
        let mut body = vec![];
        for structure in block.body.iter() {
            match structure {
                Structure::Attribute(attribute) if attribute.key.value().as_str() == "in" => {
                    let attribute_location = location_of(document, attribute);
                    items = Some(self.expr(attribute.value.clone().into(), &attribute_location)?);
                }
                Structure::Attribute(attribute) => body.extend(self.attribute(document, attribute)),
                Structure::Block(nested) => body.extend(self.block(document, nested, Context::Code)),
            }
        }

        let Some(items) = items else {
            self.errors.log(Issue::MissingAttribute {
                keyword: "each".to_string(),
                attribute: "in",
                location,
            });
            return None;
        };

        Some(Statement::Each {
            names: labels.iter().map(|label| label.to_string()).collect(),
            items,
            body,
            location,
        })
    }

    fn expr(&mut self, expr: hcl::Expression, location: &Location) -> Option<Expr> {
        match lower_expr(expr, location) {
            Ok(expr) => Some(expr),
            Err(message) => {
                self.errors.log(Issue::InvalidExpression {
                    message,
                    location: location.clone(),
                });
                None
            }
        }
    }
}

/// Plain strings become literals, strings containing `$` are interpolated at evaluation time
fn string_expr(s: String) -> Expr {
    if s.contains('$') {
        Expr::Interpolated(s)
    } else {
        Expr::Literal(Value::String(s))
    }
}

fn lower_exprs(exprs: Vec<hcl::Expression>, location: &Location) -> Result<Vec<Expr>, String> {
    exprs.into_iter().map(|expr| lower_expr(expr, location)).collect()
}

fn lower_expr(expr: hcl::Expression, location: &Location) -> Result<Expr, String> {
    use hcl::Expression as E;

    Ok(match expr {
        E::Null => Expr::Literal(Value::Undef),
        E::Bool(b) => Expr::Literal(Value::Boolean(b)),
        E::Number(number) => Expr::Literal(number.into()),
        E::String(s) => string_expr(s),
        E::TemplateExpr(template) => lower_template(&template, location)?,
        E::Array(items) => Expr::Array(lower_exprs(items, location)?),
        E::Object(object) => Expr::Hash(
            object
                .into_iter()
                .map(|(key, value)| {
                    let key = match key {
                        ObjectKey::Identifier(ident) => Expr::string(ident.to_string()),
                        ObjectKey::Expression(expr) => lower_expr(expr, location)?,
                        _ => return Err("unsupported object key".to_string()),
                    };
                    Ok((key, lower_expr(value, location)?))
                })
                .collect::<Result<_, String>>()?,
        ),
        E::Variable(variable) => Expr::Variable(variable.as_str().to_string()),
        E::Traversal(traversal) => lower_traversal(*traversal, location)?,
        E::FuncCall(call) => Expr::Call {
            function: call.name.to_string(),
            args: lower_exprs(call.args, location)?,
            location: location.clone(),
        },
        E::Parenthesis(inner) => lower_expr(*inner, location)?,
        E::Conditional(conditional) => Expr::Conditional {
            condition: Box::new(lower_expr(conditional.cond_expr, location)?),
            then: Box::new(lower_expr(conditional.true_expr, location)?),
            otherwise: Box::new(lower_expr(conditional.false_expr, location)?),
        },
        E::Operation(operation) => lower_operation(*operation, location)?,
        E::ForExpr(_) => return Err("for expressions are not supported, use an `each` block".to_string()),
        _ => return Err("unsupported expression".to_string()),
    })
}

/// `where` attribute of a collection: comparisons of parameter names joined by `&&` and `||`
fn lower_query(expr: hcl::Expression, location: &Location) -> Result<Query<Expr>, String> {
    query(lower_expr(expr, location)?)
}

fn query(expr: Expr) -> Result<Query<Expr>, String> {
    match expr {
        Expr::Binary {
            op: BinaryOp::And,
            lhs,
            rhs,
        } => Ok(Query::And(Box::new(query(*lhs)?), Box::new(query(*rhs)?))),
        Expr::Binary {
            op: BinaryOp::Or,
            lhs,
            rhs,
        } => Ok(Query::Or(Box::new(query(*lhs)?), Box::new(query(*rhs)?))),
        Expr::Binary {
            op: op @ (BinaryOp::Eq | BinaryOp::NotEq),
            lhs,
            rhs,
        } => {
            let Expr::Variable(param) = *lhs else {
                return Err("the left side of a collection comparison must be a parameter name".to_string());
            };
            if param.contains("::") {
                return Err(format!("collection queries compare parameters, not the variable {param}"));
            }
            let op = if op == BinaryOp::Eq {
                CompareOp::Eq
            } else {
                CompareOp::NotEq
            };
            Ok(Query::Compare { param, op, value: *rhs })
        }
        Expr::Binary { op, .. } => Err(format!(
            "collection queries support ==, !=, && and || only (found {op:?})"
        )),
        _ => Err("collection queries support ==, !=, && and || only".to_string()),
    }
}

/// Template parts are concatenated; literal parts keep `$name` interpolation
fn lower_template(template: &TemplateExpr, location: &Location) -> Result<Expr, String> {
    let template = hcl::Template::from_expr(template).map_err(|error| error.to_string())?;

    let parts = template
        .elements()
        .iter()
        .map(|element| match element {
            Element::Literal(literal) => Ok(string_expr(literal.clone())),
            Element::Interpolation(interpolation) => lower_expr(interpolation.expr.clone(), location),
            Element::Directive(_) => Err("template directives are not supported".to_string()),
        })
        .collect::<Result<Vec<_>, String>>()?;

    Ok(Expr::Template(parts))
}

/// HCL hands operator chains over without precedence, so the chain is flattened into operands and
/// operators and rebuilt by precedence climbing. Parenthesized operands stay intact.
fn lower_operation(operation: Operation, location: &Location) -> Result<Expr, String> {
    let mut operands = vec![];
    let mut operators = vec![];
    flatten_operation(operation, &mut operands, &mut operators, location)?;

    let mut operands = operands.into_iter();
    let Some(first) = operands.next() else {
        return Err("operator without operands".to_string());
    };

    let mut output = vec![first];
    let mut pending: Vec<BinaryOp> = vec![];
    for (op, operand) in operators.into_iter().zip(operands) {
        while pending
            .last()
            .is_some_and(|top| top.precedence() >= op.precedence())
        {
            reduce(&mut output, &mut pending)?;
        }
        pending.push(op);
        output.push(operand);
    }
    while !pending.is_empty() {
        reduce(&mut output, &mut pending)?;
    }

    match (output.pop(), output.is_empty()) {
        (Some(expr), true) => Ok(expr),
        _ => Err("operator without operands".to_string()),
    }
}

fn reduce(output: &mut Vec<Expr>, pending: &mut Vec<BinaryOp>) -> Result<(), String> {
    match (pending.pop(), output.pop(), output.pop()) {
        (Some(op), Some(rhs), Some(lhs)) => {
            output.push(Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
            Ok(())
        }
        _ => Err("operator without operands".to_string()),
    }
}

fn flatten_operand(
    expr: hcl::Expression,
    operands: &mut Vec<Expr>,
    operators: &mut Vec<BinaryOp>,
    location: &Location,
) -> Result<(), String> {
    match expr {
        hcl::Expression::Operation(operation) => {
            flatten_operation(*operation, operands, operators, location)
        }
        other => {
            operands.push(lower_expr(other, location)?);
            Ok(())
        }
    }
}

fn flatten_operation(
    operation: Operation,
    operands: &mut Vec<Expr>,
    operators: &mut Vec<BinaryOp>,
    location: &Location,
) -> Result<(), String> {
    match operation {
        Operation::Binary(binary) => {
            flatten_operand(binary.lhs_expr, operands, operators, location)?;
            operators.push(binary_op(binary.operator));
            flatten_operand(binary.rhs_expr, operands, operators, location)
        }
        Operation::Unary(unary) => {
            // unary operators bind tighter than any binary operator
            let first = operands.len();
            flatten_operand(unary.expr, operands, operators, location)?;
            let Some(operand) = operands.get_mut(first) else {
                return Err("operator without operands".to_string());
            };
            let inner = Box::new(std::mem::replace(operand, Expr::Literal(Value::Undef)));
            *operand = match unary.operator {
                UnaryOperator::Not => Expr::Not(inner),
                UnaryOperator::Neg => Expr::Negate(inner),
            };
            Ok(())
        }
    }
}

fn binary_op(operator: BinaryOperator) -> BinaryOp {
    match operator {
        BinaryOperator::Eq => BinaryOp::Eq,
        BinaryOperator::NotEq => BinaryOp::NotEq,
        BinaryOperator::Less => BinaryOp::Less,
        BinaryOperator::LessEq => BinaryOp::LessEq,
        BinaryOperator::Greater => BinaryOp::Greater,
        BinaryOperator::GreaterEq => BinaryOp::GreaterEq,
        BinaryOperator::And => BinaryOp::And,
        BinaryOperator::Or => BinaryOp::Or,
        BinaryOperator::Plus => BinaryOp::Add,
        BinaryOperator::Minus => BinaryOp::Sub,
        BinaryOperator::Mul => BinaryOp::Mul,
        BinaryOperator::Div => BinaryOp::Div,
        BinaryOperator::Mod => BinaryOp::Mod,
    }
}

/// `a.b.name` is the qualified variable `a::b::name`, `File["x"]` and `Foo.Bar["x"]` are resource
/// references, `[...]` indexes into arrays and hashes
fn lower_traversal(traversal: hcl::Traversal, location: &Location) -> Result<Expr, String> {
    let mut operators = traversal.operators.into_iter().peekable();

    let mut expr = match traversal.expr {
        hcl::Expression::Variable(root) => {
            let mut path = vec![root.as_str().to_string()];
            while let Some(TraversalOperator::GetAttr(ident)) = operators.peek() {
                path.push(ident.to_string());
                operators.next();
            }

            let is_reference = path[0].starts_with(|c: char| c.is_ascii_uppercase());
            if is_reference {
                let Some(TraversalOperator::Index(title)) = operators.next() else {
                    return Err(format!(
                        "resource reference {} requires a title: {}[\"title\"]",
                        path.join("."),
                        path.join(".")
                    ));
                };
                Expr::Reference {
                    type_name: normalize_name(&path.join("::")),
                    title: Box::new(lower_expr(title, location)?),
                }
            } else {
                Expr::Variable(path.join("::"))
            }
        }
        other => lower_expr(other, location)?,
    };

    for operator in operators {
        let index = match operator {
            TraversalOperator::Index(index) => lower_expr(index, location)?,
            TraversalOperator::LegacyIndex(index) => Expr::Literal(Value::Integer(index as i64)),
            TraversalOperator::GetAttr(ident) => Expr::string(ident.to_string()),
            _ => return Err("splat expressions are not supported".to_string()),
        };
        expr = Expr::Index {
            target: Box::new(expr),
            index: Box::new(index),
        };
    }

    Ok(expr)
}

/// Every issue found while lowering
#[derive(derive_new::new, Debug)]
pub struct ManifestErrors {
    #[new(default)]
    issues: Vec<Issue>,
}

impl ManifestErrors {
    pub fn log(&mut self, issue: Issue) {
        tracing::trace!(?issue, "issue found");
        self.issues.push(issue);
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }
}

impl std::error::Error for ManifestErrors {}

impl std::fmt::Display for ManifestErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, issue) in self.issues.iter().enumerate() {
            if index > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Issue {
    #[error("`{keyword}` expects {expected} at {location}")]
    LabelCount {
        keyword: String,
        expected: &'static str,
        location: Location,
    },
    #[error("`{keyword}` is only allowed at top level or inside a class at {location}")]
    NestedDefinition { keyword: String, location: Location },
    #[error("`{keyword}` is not allowed here at {location}")]
    Misplaced { keyword: String, location: Location },
    #[error("`{keyword}` must be empty at {location}")]
    NotEmpty { keyword: String, location: Location },
    #[error("`{keyword}` requires the attribute `{attribute}` at {location}")]
    MissingAttribute {
        keyword: String,
        attribute: &'static str,
        location: Location,
    },
    #[error("resource requires a title label or a `title` attribute at {location}")]
    MissingTitle { location: Location },
    #[error("resource has both a title label and a `title` attribute at {location}")]
    DuplicateTitle { location: Location },
    #[error("{kind} {name} is already defined at {existing}; cannot redefine at {location}")]
    DuplicateDefinition {
        kind: &'static str,
        name: String,
        existing: Location,
        location: Location,
    },
    #[error("`{name}` is a reserved name at {location}")]
    ReservedName { name: String, location: Location },
    #[error("{message} at {location}")]
    InvalidExpression { message: String, location: Location },
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hcl_documents;
    use pretty_assertions::assert_eq;

    fn lower_ok(documents: HclDocuments) -> Manifest {
        lower(&documents, &FunctionRegistry::standard()).expect("must lower")
    }

    fn lower_err(documents: HclDocuments) -> ManifestErrors {
        lower(&documents, &FunctionRegistry::standard()).expect_err("must fail")
    }

    fn line(line: usize) -> Location {
        Location::new(None, line)
    }

    #[test]
    fn assignments_and_statement_functions() {
        let manifest = lower_ok(hcl_documents!("x = \"a\"\ninclude = [\"one\", \"two\"]\nnotice = \"hi $x\"\n"));

        assert_eq!(
            manifest.main,
            vec![
                Statement::Assign {
                    name: "x".into(),
                    value: Expr::string("a"),
                    location: line(1),
                },
                Statement::Call {
                    function: "include".into(),
                    args: vec![Expr::string("one"), Expr::string("two")],
                    location: line(2),
                },
                Statement::Call {
                    function: "notice".into(),
                    args: vec![Expr::Interpolated("hi $x".into())],
                    location: line(3),
                },
            ]
        );
    }

    #[test]
    fn classes_nest_and_inherit() {
        let manifest = lower_ok(hcl_documents!(
            r#"
class apache {
  params {
    port = 80
    docroot = null
  }
  class mod inherits apache {}
  define vhost {}
}
"#
        ));

        let apache = &manifest.classes["apache"];
        assert_eq!(
            apache.parameters,
            vec![
                Parameter {
                    name: "port".into(),
                    default: Some(Expr::Literal(Value::Integer(80))),
                },
                Parameter {
                    name: "docroot".into(),
                    default: None,
                },
            ]
        );
        assert_eq!(manifest.classes["apache::mod"].parent.as_deref(), Some("apache"));
        assert!(manifest.defines.contains_key("apache::vhost"));
    }

    #[test]
    fn resources_in_all_forms() {
        let manifest = lower_ok(hcl_documents!(
            r#"
file "/tmp/a" { owner = "root" }
virtual user "bob" {}
exported host "h" {}
resource class "ntp" { servers = ["a"] }
package { title = ["vim", "git"] }
"#
        ));

        let forms: Vec<(String, Form)> = manifest
            .main
            .iter()
            .map(|statement| match statement {
                Statement::Resource { type_name, form, .. } => (type_name.clone(), *form),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            forms,
            vec![
                ("file".into(), Form::Real),
                ("user".into(), Form::Virtual),
                ("host".into(), Form::Exported),
                ("class".into(), Form::Real),
                ("package".into(), Form::Real),
            ]
        );
    }

    #[test]
    fn collection_query() {
        let manifest = lower_ok(hcl_documents!(
            r#"
collect exported file {
  where = (title == "/tmp/f" || tag != "web") && owner == "root"
  mode = "0600"
}
"#
        ));

        let Statement::Collect {
            query, form, params, ..
        } = &manifest.main[0]
        else {
            panic!("expected collection");
        };
        assert_eq!(*form, Form::Exported);
        assert_eq!(params.len(), 1);
        assert_eq!(
            query.as_ref().unwrap(),
            &Query::And(
                Box::new(Query::Or(
                    Box::new(Query::Compare {
                        param: "title".into(),
                        op: CompareOp::Eq,
                        value: Expr::string("/tmp/f"),
                    }),
                    Box::new(Query::Compare {
                        param: "tag".into(),
                        op: CompareOp::NotEq,
                        value: Expr::string("web"),
                    }),
                )),
                Box::new(Query::Compare {
                    param: "owner".into(),
                    op: CompareOp::Eq,
                    value: Expr::string("root"),
                }),
            )
        );
    }

    #[test]
    fn query_comparisons_bind_tighter_than_and() {
        let manifest = lower_ok(hcl_documents!(
            "collect user {\n  where = shell == \"/bin/sh\" && uid == 1\n}\n"
        ));

        let Statement::Collect { query, .. } = &manifest.main[0] else {
            panic!("expected collection");
        };
        assert_eq!(
            query.as_ref().unwrap(),
            &Query::And(
                Box::new(Query::Compare {
                    param: "shell".into(),
                    op: CompareOp::Eq,
                    value: Expr::string("/bin/sh"),
                }),
                Box::new(Query::Compare {
                    param: "uid".into(),
                    op: CompareOp::Eq,
                    value: Expr::Literal(Value::Integer(1)),
                }),
            )
        );
    }

    #[test]
    fn operators_follow_precedence_and_associate_left() {
        let manifest = lower_ok(hcl_documents!(
            "x = 10 - 2 - 3\ny = a == \"x\" && b == 1 || !c\nz = (1 + 2) * 3\n"
        ));

        let int = |i| Box::new(Expr::Literal(Value::Integer(i)));
        let var = |name: &str| Box::new(Expr::Variable(name.to_string()));
        let binary = |op, lhs, rhs| Box::new(Expr::Binary { op, lhs, rhs });

        let values: Vec<_> = manifest
            .main
            .iter()
            .map(|statement| match statement {
                Statement::Assign { value, .. } => value.clone(),
                other => panic!("expected assignment, got {other:?}"),
            })
            .collect();

        assert_eq!(
            values,
            vec![
                *binary(BinaryOp::Sub, binary(BinaryOp::Sub, int(10), int(2)), int(3)),
                *binary(
                    BinaryOp::Or,
                    binary(
                        BinaryOp::And,
                        binary(BinaryOp::Eq, var("a"), Box::new(Expr::string("x"))),
                        binary(BinaryOp::Eq, var("b"), int(1)),
                    ),
                    Box::new(Expr::Not(var("c"))),
                ),
                *binary(BinaryOp::Mul, binary(BinaryOp::Add, int(1), int(2)), int(3)),
            ]
        );
    }

    #[test]
    fn templates_lower_to_parts() {
        let manifest = lower_ok(hcl_documents!("x = \"port ${apache.port + 1}!\"\n"));

        let Statement::Assign { value, .. } = &manifest.main[0] else {
            panic!("expected assignment");
        };
        assert_eq!(
            value,
            &Expr::Template(vec![
                Expr::string("port "),
                Expr::Binary {
                    op: BinaryOp::Add,
                    lhs: Box::new(Expr::Variable("apache::port".into())),
                    rhs: Box::new(Expr::Literal(Value::Integer(1))),
                },
                Expr::string("!"),
            ])
        );
    }

    #[test]
    fn template_directives_are_rejected() {
        let errors = lower_err(hcl_documents!("x = \"%{ if true }a%{ endif }\"\n"));
        assert!(matches!(errors.issues[0], Issue::InvalidExpression { .. }));
    }

    #[test]
    fn references_and_qualified_variables() {
        let manifest = lower_ok(hcl_documents!(
            "a = File[\"/tmp/x\"]\nb = Apache.Vhost[\"www\"]\nc = apache.port\nd = list[0]\n"
        ));

        let values: Vec<&Expr> = manifest
            .main
            .iter()
            .map(|statement| match statement {
                Statement::Assign { value, .. } => value,
                other => panic!("unexpected {other:?}"),
            })
            .collect();

        assert_eq!(
            values,
            vec![
                &Expr::Reference {
                    type_name: "file".into(),
                    title: Box::new(Expr::string("/tmp/x")),
                },
                &Expr::Reference {
                    type_name: "apache::vhost".into(),
                    title: Box::new(Expr::string("www")),
                },
                &Expr::Variable("apache::port".into()),
                &Expr::Index {
                    target: Box::new(Expr::Variable("list".into())),
                    index: Box::new(Expr::Literal(Value::Integer(0))),
                },
            ]
        );
    }

    #[test]
    fn control_flow() {
        let manifest = lower_ok(hcl_documents!(
            r#"
if {
  condition = os == "linux"
  then {
    each pkg {
      in = ["a", "b"]
      next {}
    }
  }
  else {
    return {}
  }
}
"#
        ));

        let Statement::If { then, otherwise, .. } = &manifest.main[0] else {
            panic!("expected if");
        };
        assert!(matches!(&then[0], Statement::Each { names, body, .. } if names == &["pkg"] && body == &[Statement::Next]));
        assert_eq!(otherwise, &vec![Statement::Return]);
    }

    #[test]
    fn nodes() {
        let manifest = lower_ok(hcl_documents!(
            "node \"web01\" \"web01.example.com\" inherits base {}\nnode base {}\nnode default {}\n"
        ));

        assert_eq!(manifest.nodes.len(), 3);
        assert_eq!(manifest.nodes[0].names, vec!["web01", "web01.example.com"]);
        assert_eq!(manifest.nodes[0].parent.as_deref(), Some("base"));
    }

    #[test]
    fn issues_are_collected() {
        let errors = lower_err(hcl_documents! {
            "one.mcc.hcl" => "class a {}\nfile {}\n",
            "two.mcc.hcl" => "class a {}\nif {\n  then {}\n}\nx = [for v in y : v]\n"
        });

        assert_eq!(errors.issues().len(), 4);
        assert!(matches!(errors.issues()[0], Issue::MissingTitle { .. }));
        assert!(matches!(
            &errors.issues()[1],
            Issue::DuplicateDefinition { kind: "class", name, .. } if name == "a"
        ));
        assert!(matches!(errors.issues()[2], Issue::MissingAttribute { .. }));
        assert!(matches!(errors.issues()[3], Issue::InvalidExpression { .. }));
    }

    #[test]
    fn misplaced_definitions() {
        let errors = lower_err(hcl_documents!(
            "define d {\n  class inner {}\n}\nclass c {\n  node n {}\n}\nclass main {}\n"
        ));

        assert!(matches!(errors.issues()[0], Issue::NestedDefinition { .. }));
        assert!(matches!(errors.issues()[1], Issue::NestedDefinition { .. }));
        assert!(matches!(errors.issues()[2], Issue::ReservedName { .. }));
    }
}
