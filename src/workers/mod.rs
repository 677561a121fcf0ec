pub mod refresh_token_cleanup;
