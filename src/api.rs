use rocket::Route;

mod commitments;
mod operator;
mod tokens;
mod verify;

pub use operator::OPERATOR_KEY_HEADER;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(tokens::routes());
    routes.extend(commitments::routes());
    routes.extend(verify::routes());
    routes.extend(operator::routes());
    routes
}
