//! Minimal Sirocco server: static routes, path params and JSON.
//!
//! ```bash
//! cargo run --example hello_world
//! curl http://127.0.0.1:8080/users/42
//! ```

use serde::Deserialize;
use sirocco_core::prelude::*;

#[derive(Deserialize)]
struct CreateUser {
    name: String,
}

fn main() -> sirocco_core::Result<()> {
    init_logging();

    let mut router = Router::new();
    router.get("/", |_ctx: RequestContext| async {
        Ok(Response::ok("Hello, World!"))
    });
    router.get("/users/:id", |ctx: RequestContext| async move {
        let id = ctx.param("id").unwrap_or("?").to_string();
        Ok(Response::json(&serde_json::json!({ "id": id })))
    });
    router.post("/users", |ctx: RequestContext| async move {
        let Json(user): Json<CreateUser> = match ctx.extract() {
            Ok(json) => json,
            Err(res) => return Ok(res),
        };
        Ok(Response::json(&serde_json::json!({ "created": user.name })).status(201))
    });

    Server::bind("127.0.0.1:8080").serve(router)
}
