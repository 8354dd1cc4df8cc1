//! Rewrites vendor context references into target environment references.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::ir::matrix_token;

static SHELL_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(\{)?([A-Za-z_][A-Za-z0-9_]*)(\})?").expect("valid shell variable pattern")
});

static GITHUB_EXPR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([^}]*?)\s*\}\}").expect("valid expression pattern"));

static GITHUB_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(secrets|env|vars|matrix|inputs)\.([A-Za-z_][A-Za-z0-9_-]*)$")
        .expect("valid context path pattern")
});

static PARAMETER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<<\s*(pipeline\.)?parameters\.([A-Za-z_][A-Za-z0-9_-]*)\s*>>")
        .expect("valid parameter pattern")
});

/// Predefined variables of each source vendor and their target names.
pub const GITLAB_VARIABLES: &[(&str, &str)] = &[
    ("CI_COMMIT_SHA", "BUILDKITE_COMMIT"),
    ("CI_COMMIT_BRANCH", "BUILDKITE_BRANCH"),
    ("CI_COMMIT_REF_NAME", "BUILDKITE_BRANCH"),
    ("CI_COMMIT_TAG", "BUILDKITE_TAG"),
    ("CI_COMMIT_MESSAGE", "BUILDKITE_MESSAGE"),
    ("CI_PIPELINE_ID", "BUILDKITE_BUILD_ID"),
    ("CI_PIPELINE_IID", "BUILDKITE_BUILD_NUMBER"),
    ("CI_PIPELINE_SOURCE", "BUILDKITE_SOURCE"),
    ("CI_JOB_ID", "BUILDKITE_JOB_ID"),
    ("CI_JOB_NAME", "BUILDKITE_LABEL"),
    ("CI_PROJECT_DIR", "BUILDKITE_BUILD_CHECKOUT_PATH"),
    ("CI_PROJECT_NAME", "BUILDKITE_PIPELINE_SLUG"),
    ("CI_MERGE_REQUEST_IID", "BUILDKITE_PULL_REQUEST"),
    ("CI_DEFAULT_BRANCH", "BUILDKITE_PIPELINE_DEFAULT_BRANCH"),
    ("CI_NODE_INDEX", "BUILDKITE_PARALLEL_JOB"),
    ("CI_NODE_TOTAL", "BUILDKITE_PARALLEL_JOB_COUNT"),
];

pub const CIRCLECI_VARIABLES: &[(&str, &str)] = &[
    ("CIRCLE_SHA1", "BUILDKITE_COMMIT"),
    ("CIRCLE_BRANCH", "BUILDKITE_BRANCH"),
    ("CIRCLE_TAG", "BUILDKITE_TAG"),
    ("CIRCLE_BUILD_NUM", "BUILDKITE_BUILD_NUMBER"),
    ("CIRCLE_WORKING_DIRECTORY", "BUILDKITE_BUILD_CHECKOUT_PATH"),
    ("CIRCLE_PROJECT_REPONAME", "BUILDKITE_PIPELINE_SLUG"),
    ("CIRCLE_PR_NUMBER", "BUILDKITE_PULL_REQUEST"),
    ("CIRCLE_NODE_INDEX", "BUILDKITE_PARALLEL_JOB"),
    ("CIRCLE_NODE_TOTAL", "BUILDKITE_PARALLEL_JOB_COUNT"),
    ("CIRCLE_JOB", "BUILDKITE_LABEL"),
];

pub const BITBUCKET_VARIABLES: &[(&str, &str)] = &[
    ("BITBUCKET_COMMIT", "BUILDKITE_COMMIT"),
    ("BITBUCKET_BRANCH", "BUILDKITE_BRANCH"),
    ("BITBUCKET_TAG", "BUILDKITE_TAG"),
    ("BITBUCKET_BUILD_NUMBER", "BUILDKITE_BUILD_NUMBER"),
    ("BITBUCKET_CLONE_DIR", "BUILDKITE_BUILD_CHECKOUT_PATH"),
    ("BITBUCKET_REPO_SLUG", "BUILDKITE_PIPELINE_SLUG"),
    ("BITBUCKET_PR_ID", "BUILDKITE_PULL_REQUEST"),
    ("BITBUCKET_PARALLEL_STEP", "BUILDKITE_PARALLEL_JOB"),
    ("BITBUCKET_PARALLEL_STEP_COUNT", "BUILDKITE_PARALLEL_JOB_COUNT"),
];

pub const JENKINS_VARIABLES: &[(&str, &str)] = &[
    ("GIT_COMMIT", "BUILDKITE_COMMIT"),
    ("BRANCH_NAME", "BUILDKITE_BRANCH"),
    ("GIT_BRANCH", "BUILDKITE_BRANCH"),
    ("TAG_NAME", "BUILDKITE_TAG"),
    ("BUILD_NUMBER", "BUILDKITE_BUILD_NUMBER"),
    ("BUILD_ID", "BUILDKITE_BUILD_ID"),
    ("WORKSPACE", "BUILDKITE_BUILD_CHECKOUT_PATH"),
    ("JOB_NAME", "BUILDKITE_PIPELINE_SLUG"),
    ("CHANGE_ID", "BUILDKITE_PULL_REQUEST"),
];

const GITHUB_CONTEXT: &[(&str, &str)] = &[
    ("github.sha", "BUILDKITE_COMMIT"),
    ("github.ref_name", "BUILDKITE_BRANCH"),
    ("github.head_ref", "BUILDKITE_BRANCH"),
    ("github.run_id", "BUILDKITE_BUILD_ID"),
    ("github.run_number", "BUILDKITE_BUILD_NUMBER"),
    ("github.workspace", "BUILDKITE_BUILD_CHECKOUT_PATH"),
    ("github.actor", "BUILDKITE_BUILD_CREATOR"),
    ("github.event_name", "BUILDKITE_SOURCE"),
    ("github.job", "BUILDKITE_LABEL"),
    ("github.event.pull_request.number", "BUILDKITE_PULL_REQUEST"),
    ("github.event.repository.name", "BUILDKITE_PIPELINE_SLUG"),
];

/// Renames `$NAME` / `${NAME}` references according to `table`.
pub fn rename_variables(text: &str, table: &[(&str, &str)]) -> String {
    SHELL_VAR
        .replace_all(text, |caps: &Captures| {
            let name = &caps[2];
            let braced = caps.get(1).is_some() && caps.get(3).is_some();
            match table.iter().find(|(from, _)| *from == name) {
                Some((_, to)) if braced => format!("${{{to}}}"),
                Some((_, to)) => format!("${to}{}", caps.get(3).map_or("", |m| m.as_str())),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Target name of a predefined variable, if `name` is one.
pub fn rename_variable(name: &str, table: &[(&str, &str)]) -> String {
    table
        .iter()
        .find(|(from, _)| *from == name)
        .map_or_else(|| name.to_string(), |(_, to)| (*to).to_string())
}

/// Rewrites `${{ ... }}` expressions.
///
/// Secrets, env and vars references become environment references, matrix
/// references become matrix tokens and well-known `github.*` values become
/// their target equivalents. Anything else is left untouched.
pub fn rewrite_github(text: &str) -> String {
    GITHUB_EXPR
        .replace_all(text, |caps: &Captures| {
            let inner = caps[1].trim();
            if let Some((_, to)) = GITHUB_CONTEXT.iter().find(|(from, _)| *from == inner) {
                return format!("${to}");
            }
            match GITHUB_PATH.captures(inner) {
                Some(path) if &path[1] == "matrix" => matrix_token(&path[2]),
                Some(path) => format!("${}", path[2].replace('-', "_")),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Whether `text` still carries a `${{ ... }}` expression.
pub fn has_github_expression(text: &str) -> bool {
    GITHUB_EXPR.is_match(text)
}

/// Substitutes `<< parameters.NAME >>` and `<< pipeline.parameters.NAME >>`.
///
/// Returns the names that had no value, leaving those references in place.
pub fn substitute_parameters<F>(text: &str, mut lookup: F) -> (String, Vec<String>)
where
    F: FnMut(bool, &str) -> Option<String>,
{
    let mut missing = Vec::new();
    let result = PARAMETER
        .replace_all(text, |caps: &Captures| {
            let pipeline = caps.get(1).is_some();
            match lookup(pipeline, &caps[2]) {
                Some(value) => value,
                None => {
                    missing.push(caps[2].to_string());
                    caps[0].to_string()
                }
            }
        })
        .into_owned();
    (result, missing)
}

/// Rewrites `<< matrix.NAME >>` CircleCI matrix references into matrix tokens.
pub fn rewrite_circleci_matrix(text: &str, dimensions: &[String]) -> String {
    dimensions.iter().fold(text.to_string(), |acc, name| {
        acc.replace(&format!("<< matrix.{name} >>"), &matrix_token(name))
            .replace(&format!("<<matrix.{name}>>"), &matrix_token(name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(test)]
    mod rename_variables {
        use super::*;

        #[test]
        fn renames_plain_and_braced() {
            let text = "git checkout $CI_COMMIT_SHA && echo ${CI_COMMIT_BRANCH}";
            assert_eq!(
                rename_variables(text, GITLAB_VARIABLES),
                "git checkout $BUILDKITE_COMMIT && echo ${BUILDKITE_BRANCH}"
            );
        }

        #[test]
        fn leaves_unknown_variables() {
            assert_eq!(rename_variables("echo $HOME ${PATH}", GITLAB_VARIABLES), "echo $HOME ${PATH}");
        }

        #[test]
        fn does_not_match_prefixes() {
            assert_eq!(
                rename_variables("$CI_COMMIT_SHA_SHORT", GITLAB_VARIABLES),
                "$CI_COMMIT_SHA_SHORT",
                "Should only rename whole variable names"
            );
        }
    }

    #[cfg(test)]
    mod rewrite_github {
        use super::*;

        #[test]
        fn rewrites_context_values() {
            assert_eq!(
                rewrite_github("docker build -t app:${{ github.sha }} ."),
                "docker build -t app:$BUILDKITE_COMMIT ."
            );
        }

        #[test]
        fn rewrites_secrets_and_env() {
            assert_eq!(
                rewrite_github("login -p ${{ secrets.TOKEN }} -u ${{env.USER}}"),
                "login -p $TOKEN -u $USER"
            );
        }

        #[test]
        fn rewrites_matrix_to_token() {
            assert_eq!(rewrite_github("nvm use ${{ matrix.node }}"), "nvm use {{matrix.node}}");
        }

        #[test]
        fn keeps_unknown_expressions() {
            let text = "echo ${{ steps.meta.outputs.tags }}";
            assert_eq!(rewrite_github(text), text);
            assert!(has_github_expression(&rewrite_github(text)));
        }
    }

    #[test]
    fn test_substitute_parameters_reports_missing() {
        let (text, missing) = substitute_parameters(
            "npm run << parameters.script >> -- << pipeline.parameters.flag >>",
            |pipeline, name| (!pipeline && name == "script").then(|| "build".to_string()),
        );
        assert_eq!(text, "npm run build -- << pipeline.parameters.flag >>");
        assert_eq!(missing, vec!["flag"]);
    }

    #[test]
    fn test_rewrite_circleci_matrix() {
        let dims = vec!["version".to_string()];
        assert_eq!(
            rewrite_circleci_matrix("use << matrix.version >>", &dims),
            "use {{matrix.version}}"
        );
    }
}
