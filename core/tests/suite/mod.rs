mod common;
mod tool_service;
