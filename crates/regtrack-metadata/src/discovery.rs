//! AST-level test discovery
//!
//! Walks Python sources with tree-sitter and extracts `testbed(...)` and
//! `testmanagement(...)` decorators from test-named functions and classes.
//! Purely syntactic; nothing is ever executed. Unknown decorators are
//! ignored; known decorators with invalid arguments fail the whole file so
//! the sync can report it.

use std::collections::HashSet;

use tree_sitter::{Node, Parser};

use regtrack_storage::{MetadataContent, TestState};

/// One test symbol found in a source file
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredTest {
    /// Dotted path matching the names the importer stores, e.g.
    /// `tests.routing.test_bgp.TestBgp.test_converge`
    pub testcase_name: String,
    pub content: MetadataContent,
}

/// Decorator argument values collected from one symbol
#[derive(Debug, Default, Clone)]
struct DecoratorInfo {
    topology: Option<String>,
    testrail_id: Option<String>,
    test_case_id: Option<String>,
    priority: Option<String>,
}

/// Parse the `staging_tests` ini file into a membership set
///
/// Section headers and `;`/`#` comments are skipped; each remaining line
/// contributes its key (the part before `=`, if any).
pub fn parse_staging_list(content: &str) -> HashSet<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && !line.starts_with('[')
                && !line.starts_with(';')
                && !line.starts_with('#')
        })
        .map(|line| {
            line.split('=')
                .next()
                .unwrap_or(line)
                .trim()
                .to_string()
        })
        .collect()
}

/// Derive the path-based module: second segment under the test root
pub fn module_from_path(relative_path: &str, test_root: &str) -> Option<String> {
    let mut parts = relative_path.split('/');
    if parts.next() != Some(test_root) {
        return None;
    }
    let candidate = parts.next()?;
    // A file directly under the root has no module directory
    parts.next()?;
    Some(candidate.to_string())
}

/// Extract every test symbol from one Python source file
///
/// `relative_path` is the file's path from the mirror root with forward
/// slashes; it provides the dotted prefix of testcase names, the stored
/// `test_path` and the path-derived module.
///
/// # Errors
///
/// Returns a human-readable reason when the source does not parse or a
/// known decorator carries invalid arguments; the caller records it as a
/// per-file failure.
pub fn discover_file(
    source: &str,
    relative_path: &str,
    test_root: &str,
    staging: &HashSet<String>,
) -> Result<Vec<DiscoveredTest>, String> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| format!("python grammar unavailable: {e}"))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| "tree-sitter gave up on the file".to_string())?;

    let dotted_prefix = relative_path
        .trim_end_matches(".py")
        .replace('/', ".");
    let module = module_from_path(relative_path, test_root);

    let mut context = FileContext {
        source,
        relative_path,
        dotted_prefix,
        module,
        staging,
        discovered: Vec::new(),
    };
    context.walk_block(tree.root_node(), None)?;
    Ok(context.discovered)
}

struct FileContext<'a> {
    source: &'a str,
    relative_path: &'a str,
    dotted_prefix: String,
    module: Option<String>,
    staging: &'a HashSet<String>,
    discovered: Vec<DiscoveredTest>,
}

impl FileContext<'_> {
    fn text(&self, node: Node<'_>) -> &str {
        node.utf8_text(self.source.as_bytes()).unwrap_or("")
    }

    /// Walk the statements of a module or class body
    fn walk_block(&mut self, block: Node<'_>, class: Option<&str>) -> Result<(), String> {
        let mut cursor = block.walk();
        let children: Vec<Node<'_>> = block.named_children(&mut cursor).collect();

        for child in children {
            match child.kind() {
                "decorated_definition" => {
                    let Some(definition) = child.child_by_field_name("definition") else {
                        continue;
                    };
                    let info = self.collect_decorators(child)?;
                    self.visit_definition(definition, class, info)?;
                }
                "function_definition" | "class_definition" => {
                    self.visit_definition(child, class, DecoratorInfo::default())?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn visit_definition(
        &mut self,
        definition: Node<'_>,
        class: Option<&str>,
        info: DecoratorInfo,
    ) -> Result<(), String> {
        let Some(name_node) = definition.child_by_field_name("name") else {
            return Ok(());
        };
        let name = self.text(name_node).to_string();

        match definition.kind() {
            "function_definition" if name.starts_with("test") => {
                self.record(&name, class, info);
            }
            "class_definition" => {
                if name.starts_with("Test") {
                    self.record(&name, None, info);
                }
                if let Some(body) = definition.child_by_field_name("body") {
                    self.walk_block(body, Some(&name))?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn record(&mut self, symbol: &str, class: Option<&str>, info: DecoratorInfo) {
        let testcase_name = match class {
            Some(class) => format!("{}.{class}.{symbol}", self.dotted_prefix),
            None => format!("{}.{symbol}", self.dotted_prefix),
        };

        let test_state = if self.staging.contains(&testcase_name) || self.staging.contains(symbol) {
            TestState::Staging
        } else {
            TestState::Prod
        };

        self.discovered.push(DiscoveredTest {
            testcase_name,
            content: MetadataContent {
                test_class_name: class.map(str::to_string),
                module: self.module.clone(),
                topology: info.topology,
                test_state,
                test_case_id: info.test_case_id,
                testrail_id: info.testrail_id,
                priority: info.priority,
                test_path: Some(self.relative_path.to_string()),
            },
        });
    }

    /// Fold every known decorator of one decorated definition
    fn collect_decorators(&self, decorated: Node<'_>) -> Result<DecoratorInfo, String> {
        let mut info = DecoratorInfo::default();

        let mut cursor = decorated.walk();
        for child in decorated.named_children(&mut cursor) {
            if child.kind() != "decorator" {
                continue;
            }
            let Some(call) = child.named_child(0).filter(|n| n.kind() == "call") else {
                continue;
            };
            let Some(function) = call.child_by_field_name("function") else {
                continue;
            };
            // Rightmost segment handles both `testbed` and `marks.testbed`
            let name = self
                .text(function)
                .rsplit('.')
                .next()
                .unwrap_or("")
                .to_string();

            match name.as_str() {
                "testbed" => self.apply_testbed(call, &mut info)?,
                "testmanagement" => self.apply_testmanagement(call, &mut info)?,
                _ => {}
            }
        }
        Ok(info)
    }

    fn apply_testbed(&self, call: Node<'_>, info: &mut DecoratorInfo) -> Result<(), String> {
        for (key, value) in self.keyword_arguments(call) {
            if key == "topology" {
                info.topology = Some(value);
            }
        }
        Ok(())
    }

    fn apply_testmanagement(&self, call: Node<'_>, info: &mut DecoratorInfo) -> Result<(), String> {
        for (key, value) in self.keyword_arguments(call) {
            match key.as_str() {
                "case" => {
                    let case: u64 = value.parse().map_err(|_| {
                        format!(
                            "{}: testmanagement(case=...) wants an integer, got '{value}'",
                            self.relative_path
                        )
                    })?;
                    info.testrail_id = Some(format!("C{case}"));
                }
                "qtest_tc_id" => info.test_case_id = Some(value),
                "priority" => info.priority = Some(normalize_priority(&value)),
                _ => {}
            }
        }
        Ok(())
    }

    /// Keyword arguments of a call as (name, literal text) pairs
    fn keyword_arguments(&self, call: Node<'_>) -> Vec<(String, String)> {
        let Some(arguments) = call.child_by_field_name("arguments") else {
            return Vec::new();
        };

        let mut cursor = arguments.walk();
        arguments
            .named_children(&mut cursor)
            .filter(|n| n.kind() == "keyword_argument")
            .filter_map(|kw| {
                let name = kw.child_by_field_name("name")?;
                let value = kw.child_by_field_name("value")?;
                Some((self.text(name).to_string(), self.literal_text(value)))
            })
            .collect()
    }

    /// The payload of a literal value node, quotes stripped for strings
    fn literal_text(&self, node: Node<'_>) -> String {
        let raw = self.text(node);
        if node.kind() == "string" {
            raw.trim_matches(|c| c == '"' || c == '\'').to_string()
        } else {
            raw.to_string()
        }
    }
}

/// Only P0..P3 survive; anything else reads as UNKNOWN
fn normalize_priority(raw: &str) -> String {
    match raw {
        "P0" | "P1" | "P2" | "P3" => raw.to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
import pytest
from testlib import testbed, testmanagement


def helper():
    pass


@testbed(topology="dual-leaf")
@testmanagement(case=1234, qtest_tc_id="QT-88", priority="P1")
def test_bgp_convergence():
    pass


def test_undecorated():
    pass


class TestQos:
    @testmanagement(case=99, priority="critical")
    def test_shaping(self):
        pass

    def ignored_helper(self):
        pass
"#;

    fn discover(source: &str) -> Vec<DiscoveredTest> {
        discover_file(source, "tests/routing/test_bgp.py", "tests", &HashSet::new())
            .expect("discover")
    }

    #[test]
    fn test_decorated_function_extraction() {
        let tests = discover(SAMPLE);
        let bgp = tests
            .iter()
            .find(|t| t.testcase_name == "tests.routing.test_bgp.test_bgp_convergence")
            .expect("bgp test");

        assert_eq!(bgp.content.topology.as_deref(), Some("dual-leaf"));
        assert_eq!(bgp.content.testrail_id.as_deref(), Some("C1234"));
        assert_eq!(bgp.content.test_case_id.as_deref(), Some("QT-88"));
        assert_eq!(bgp.content.priority.as_deref(), Some("P1"));
        assert_eq!(bgp.content.module.as_deref(), Some("routing"));
        assert_eq!(
            bgp.content.test_path.as_deref(),
            Some("tests/routing/test_bgp.py")
        );
        assert_eq!(bgp.content.test_state, TestState::Prod);
    }

    #[test]
    fn test_undecorated_and_class_members() {
        let tests = discover(SAMPLE);
        let names: Vec<&str> = tests.iter().map(|t| t.testcase_name.as_str()).collect();

        assert!(names.contains(&"tests.routing.test_bgp.test_undecorated"));
        assert!(names.contains(&"tests.routing.test_bgp.TestQos"));
        assert!(names.contains(&"tests.routing.test_bgp.TestQos.test_shaping"));
        // Non-test helpers never show up
        assert!(!names.iter().any(|n| n.contains("helper")));

        let shaping = tests
            .iter()
            .find(|t| t.testcase_name.ends_with("test_shaping"))
            .expect("shaping");
        assert_eq!(shaping.content.test_class_name.as_deref(), Some("TestQos"));
        // Unrecognized priorities normalize instead of passing through
        assert_eq!(shaping.content.priority.as_deref(), Some("UNKNOWN"));
    }

    #[test]
    fn test_invalid_case_argument_fails_file() {
        let source = r#"
@testmanagement(case="not-a-number")
def test_broken():
    pass
"#;
        let err = discover_file(source, "tests/routing/test_x.py", "tests", &HashSet::new())
            .expect_err("must fail");
        assert!(err.contains("case"));
    }

    #[test]
    fn test_unknown_decorators_are_ignored(){
        let source = r#"
@pytest.mark.slow
@some.vendor.thing(scope="module")
def test_plain():
    pass
"#;
        let tests = discover_file(source, "tests/qos/test_y.py", "tests", &HashSet::new())
            .expect("discover");
        assert_eq!(tests.len(), 1);
        let test = tests.first().expect("one");
        assert!(test.content.topology.is_none());
        assert!(test.content.priority.is_none());
    }

    #[test]
    fn test_staging_classification() {
        let staging: HashSet<String> = ["test_bgp_convergence".to_string()].into_iter().collect();
        let tests = discover_file(SAMPLE, "tests/routing/test_bgp.py", "tests", &staging)
            .expect("discover");

        let bgp = tests
            .iter()
            .find(|t| t.testcase_name.ends_with("test_bgp_convergence"))
            .expect("bgp");
        assert_eq!(bgp.content.test_state, TestState::Staging);

        let other = tests
            .iter()
            .find(|t| t.testcase_name.ends_with("test_undecorated"))
            .expect("other");
        assert_eq!(other.content.test_state, TestState::Prod);
    }

    #[test]
    fn test_staging_ini_parsing() {
        let ini = "
[staging]
test_bgp_convergence
test_flapping = 2024-01-01
; a comment
# another comment

[other]
test_new_feature
";
        let set = parse_staging_list(ini);
        assert!(set.contains("test_bgp_convergence"));
        assert!(set.contains("test_flapping"));
        assert!(set.contains("test_new_feature"));
        assert!(!set.iter().any(|s| s.starts_with(';') || s.starts_with('#')));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_module_from_path() {
        assert_eq!(
            module_from_path("tests/routing/test_bgp.py", "tests").as_deref(),
            Some("routing")
        );
        assert_eq!(module_from_path("tests/test_top.py", "tests"), None);
        assert_eq!(module_from_path("src/helpers/util.py", "tests"), None);
    }

    #[test]
    fn test_broken_python_is_still_a_tree() {
        // tree-sitter recovers from syntax errors; discovery just returns
        // whatever decorated symbols it can still see
        let source = "def test_x(:\n    pass\n";
        let result = discover_file(source, "tests/a/b.py", "tests", &HashSet::new());
        assert!(result.is_ok());
    }
}
