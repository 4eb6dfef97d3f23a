//! GraphQL type definitions
//!
//! These types mirror the db records but are decorated with async-graphql
//! attributes.

use async_graphql::{InputObject, SimpleObject};
use serde::Serialize;

use crate::db::{CreateUser, UpdateUser, UserRecord};

/// Represents a user
#[derive(Debug, Clone, SimpleObject, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub age: i64,
    pub profession: String,
    pub friendly: bool,
}

impl From<UserRecord> for User {
    fn from(record: UserRecord) -> Self {
        User {
            id: record.id,
            name: record.name,
            email: record.email,
            age: record.age,
            profession: record.profession,
            friendly: record.friendly,
        }
    }
}

#[derive(Debug, Clone, InputObject)]
pub struct CreateUserInput {
    pub name: String,
    pub email: String,
    pub age: i64,
    pub profession: String,
    pub friendly: bool,
}

impl From<CreateUserInput> for CreateUser {
    fn from(input: CreateUserInput) -> Self {
        CreateUser {
            name: input.name,
            email: input.email,
            age: input.age,
            profession: input.profession,
            friendly: input.friendly,
        }
    }
}

#[derive(Debug, Clone, Default, InputObject)]
pub struct UpdateUserInput {
    pub name: Option<String>,
    pub email: Option<String>,
    pub age: Option<i64>,
    pub profession: Option<String>,
    pub friendly: Option<bool>,
}

impl From<UpdateUserInput> for UpdateUser {
    fn from(input: UpdateUserInput) -> Self {
        UpdateUser {
            name: input.name,
            email: input.email,
            age: input.age,
            profession: input.profession,
            friendly: input.friendly,
        }
    }
}
