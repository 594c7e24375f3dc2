//! Query language
//!
//! ```text
//! select p from Post p
//!   join fetch p.details
//!   join fetch p.comments c
//! where p.id = :id and p.name = "x"
//! ```
//!
//! Joins name either a relation (inverse side) or a reference column of an
//! alias declared earlier. Every joined row is returned alongside the
//! selected roots. Conditions apply to the root alias.

use std::collections::BTreeSet;
use std::sync::Arc;

use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_until},
    character::complete::{char, multispace0, satisfy},
    combinator::{map, not, opt, verify},
    multi::{many0, separated_list1},
    sequence::{delimited, preceded, terminated},
    IResult,
};

use crate::error::{Error, Result};
use crate::parser::{identifier, value_literal};
use crate::schema::{Schema, TableSchema, ID_COLUMN};
use crate::value::Value;

const KEYWORDS: &[&str] = &["select", "from", "join", "fetch", "where", "and"];

/// Right-hand side of a condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Named parameter, bound at execution
    Parameter(String),
    /// Inline literal
    Literal(Value),
}

/// `alias.column = operand`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// Alias the column belongs to
    pub alias: String,
    /// Column name (`id` allowed)
    pub column: String,
    /// Compared value
    pub operand: Operand,
}

/// `join fetch owner.member [alias]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    /// Alias the association is navigated from
    pub owner: String,
    /// Relation or reference column name
    pub member: String,
    /// Alias for the joined rows
    pub alias: Option<String>,
}

/// A parsed query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    text: String,
    select: String,
    entity: String,
    alias: String,
    joins: Vec<Join>,
    conditions: Vec<Condition>,
}

impl Query {
    /// Parse query text
    pub fn parse(text: &str) -> Result<Self> {
        let (rest, (select, entity, alias, joins, conditions)) = statement(text)?;
        if !rest.is_empty() {
            return Err(Error::Parse(format!("unexpected input: {}", rest)));
        }
        if select != alias {
            return Err(Error::Query(format!(
                "only the root alias `{}` can be selected",
                alias
            )));
        }

        Ok(Self {
            text: text.to_string(),
            select: select.to_string(),
            entity: entity.to_string(),
            alias: alias.to_string(),
            joins,
            conditions,
        })
    }

    /// Original query text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Root entity (table) name
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Join clauses in order
    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    /// Where-clause conditions in order
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Parameter names in order of first appearance
    pub fn parameters(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for condition in &self.conditions {
            if let Operand::Parameter(name) = &condition.operand {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Resolve every name against the schema
    pub fn plan(&self, schema: &Schema) -> Result<Plan> {
        let root = schema.require(&self.entity)?.clone();
        let mut aliases: Vec<(String, Arc<TableSchema>)> = vec![(self.alias.clone(), root.clone())];

        let mut fetches = Vec::with_capacity(self.joins.len());
        for join in &self.joins {
            let source = aliases
                .iter()
                .position(|(alias, _)| *alias == join.owner)
                .ok_or_else(|| Error::Query(format!("unknown alias `{}`", join.owner)))?;
            let owner = aliases[source].1.clone();

            let (table, via) = if let Some(idx) = owner.relation_index(&join.member) {
                let relation = &owner.relations()[idx];
                (schema.require(&relation.table)?.clone(), Via::Relation(idx))
            } else if let Some(idx) = owner.column_index(&join.member) {
                match owner.columns()[idx].target() {
                    Some(target) => (schema.require(target)?.clone(), Via::Reference(idx)),
                    None => {
                        return Err(Error::Query(format!(
                            "{}.{} is not an association",
                            owner.name(),
                            join.member
                        )))
                    }
                }
            } else {
                return Err(Error::Query(format!(
                    "{} has no association `{}`",
                    owner.name(),
                    join.member
                )));
            };

            if let Some(alias) = &join.alias {
                if aliases.iter().any(|(a, _)| a == alias) {
                    return Err(Error::Query(format!("alias `{}` declared twice", alias)));
                }
                aliases.push((alias.clone(), table.clone()));
            } else {
                aliases.push((String::new(), table.clone()));
            }
            fetches.push(Fetch { source, table, via });
        }

        let mut filters = Vec::with_capacity(self.conditions.len());
        for condition in &self.conditions {
            if condition.alias != self.alias {
                return Err(Error::Query(format!(
                    "conditions may only use the root alias `{}`",
                    self.alias
                )));
            }
            let column = if condition.column == ID_COLUMN {
                FilterColumn::Id
            } else {
                let idx = root.column_index(&condition.column).ok_or_else(|| {
                    Error::Query(format!("{} has no column `{}`", root.name(), condition.column))
                })?;
                FilterColumn::Column(idx)
            };
            filters.push(Filter {
                column,
                operand: condition.operand.clone(),
            });
        }

        Ok(Plan {
            root,
            filters,
            fetches,
        })
    }

    /// Every table named in from/join clauses
    pub fn spaces(&self, schema: &Schema) -> Result<BTreeSet<String>> {
        Ok(self.plan(schema)?.spaces())
    }
}

/// How a join reaches its rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    /// Inverse relation of the source table
    Relation(usize),
    /// Reference column of the source table
    Reference(usize),
}

/// A join resolved against the schema
#[derive(Debug, Clone)]
pub struct Fetch {
    /// Index of the source: 0 is the root, `n` is the n-th fetch
    pub source: usize,
    /// Joined table
    pub table: Arc<TableSchema>,
    /// Navigation
    pub via: Via,
}

/// Column a filter compares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterColumn {
    /// The identifier
    Id,
    /// A stored column
    Column(usize),
}

/// A condition resolved against the schema
#[derive(Debug, Clone)]
pub struct Filter {
    /// Compared column
    pub column: FilterColumn,
    /// Compared value
    pub operand: Operand,
}

/// An executable query
#[derive(Debug, Clone)]
pub struct Plan {
    /// Selected table
    pub root: Arc<TableSchema>,
    /// Conjunction of root filters
    pub filters: Vec<Filter>,
    /// Joins in declaration order
    pub fetches: Vec<Fetch>,
}

impl Plan {
    /// Tables touched by this plan
    pub fn spaces(&self) -> BTreeSet<String> {
        let mut spaces = BTreeSet::new();
        spaces.insert(self.root.name().to_string());
        for fetch in &self.fetches {
            spaces.insert(fetch.table.name().to_string());
        }
        spaces
    }
}

type Statement<'a> = (&'a str, &'a str, &'a str, Vec<Join>, Vec<Condition>);

fn statement(input: &str) -> IResult<&str, Statement<'_>> {
    let (input, _) = keyword("select")(input)?;
    let (input, select) = name(input)?;
    let (input, _) = keyword("from")(input)?;
    let (input, entity) = name(input)?;
    let (input, alias) = name(input)?;
    let (input, joins) = many0(join)(input)?;
    let (input, conditions) = opt(preceded(
        keyword("where"),
        separated_list1(keyword("and"), condition),
    ))(input)?;
    let (input, _) = multispace0(input)?;
    Ok((input, (select, entity, alias, joins, conditions.unwrap_or_default())))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    preceded(
        multispace0,
        terminated(tag_no_case(word), not(satisfy(is_ident_char))),
    )
}

fn name(input: &str) -> IResult<&str, &str> {
    preceded(
        multispace0,
        verify(identifier, |s: &str| {
            !KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(s))
        }),
    )(input)
}

fn path(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, owner) = name(input)?;
    let (input, _) = char('.')(input)?;
    let (input, member) = identifier(input)?;
    Ok((input, (owner, member)))
}

fn join(input: &str) -> IResult<&str, Join> {
    let (input, _) = keyword("join")(input)?;
    let (input, _) = keyword("fetch")(input)?;
    let (input, (owner, member)) = path(input)?;
    let (input, alias) = opt(name)(input)?;
    Ok((
        input,
        Join {
            owner: owner.to_string(),
            member: member.to_string(),
            alias: alias.map(str::to_string),
        },
    ))
}

fn condition(input: &str) -> IResult<&str, Condition> {
    let (input, (alias, column)) = path(input)?;
    let (input, _) = preceded(multispace0, char('='))(input)?;
    let (input, operand) = preceded(multispace0, operand)(input)?;
    Ok((
        input,
        Condition {
            alias: alias.to_string(),
            column: column.to_string(),
            operand,
        },
    ))
}

fn operand(input: &str) -> IResult<&str, Operand> {
    alt((
        map(preceded(char(':'), identifier), |p: &str| {
            Operand::Parameter(p.to_string())
        }),
        map(
            delimited(char('\''), take_until("'"), char('\'')),
            |s: &str| Operand::Literal(Value::Text(s.to_string())),
        ),
        map(value_literal, Operand::Literal),
    ))(input)
}
