pub mod auth_service;
pub mod mailer;
pub mod rate_limit_service;
pub mod token_service;
