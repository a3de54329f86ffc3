use rocket::{catchers, routes, Build, Rocket};

use crate::catchers::{bad_request, internal_error, not_found, unprocessable};
use crate::cors::CORS;
use crate::routes::{all_options, cast_vote, get_results, health, list_options, stream_results, AppState};

pub fn build(state: AppState) -> Rocket<Build> {
    rocket::build()
        .attach(CORS)
        .manage(state)
        .mount(
            "/api",
            routes![
                all_options,
                list_options,
                get_results,
                stream_results,
                health,
                cast_vote
            ],
        )
        .register("/", catchers![bad_request, not_found, unprocessable, internal_error])
}
