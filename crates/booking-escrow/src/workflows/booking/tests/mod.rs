mod admin;
mod common;
mod rectification;
