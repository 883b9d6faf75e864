//! Fakes and mock servers shared by the unit tests.

pub mod fake_scheduler;
pub mod mock_llm_server;
pub mod mock_webhook_server;
pub mod scripted_executor;
pub mod scripted_generator;
